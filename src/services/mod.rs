pub(crate) mod ledger_service;
pub(crate) mod mpesa_service;
pub(crate) mod payment_request;
