mod rate_limit;
mod sanitize;

pub use self::rate_limit::*;
pub use self::sanitize::*;
