pub mod endpoint;
pub mod urltest;

pub use endpoint::{Endpoint, DELAY_UNREACHABLE};
pub use urltest::{UrlTestGroup, UrlTestOptions};
