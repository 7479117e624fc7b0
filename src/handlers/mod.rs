pub(crate) mod payment_handlers;
