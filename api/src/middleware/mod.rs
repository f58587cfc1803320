pub mod cors;
pub mod gate;
pub mod rate_limit;
pub mod security_headers;
