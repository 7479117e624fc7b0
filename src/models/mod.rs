pub(crate) mod qr_code;
pub(crate) mod transaction;
