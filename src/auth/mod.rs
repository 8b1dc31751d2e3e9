pub mod hmac;

pub use hmac::{AuthError, HmacAuthenticator};
