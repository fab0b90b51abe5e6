mod ua_parser;

pub use ua_parser::{client_metadata, parse_user_agent};
