pub mod authenticator;
pub mod middleware;
pub mod principal;
pub mod tokens;

pub use authenticator::{AuthRejection, Authenticator};
pub use principal::{Principal, Role};
