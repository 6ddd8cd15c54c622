//! Proxy front-end gates for client authentication and the IP allow-list

mod allow_list;
mod auth;

pub use allow_list::IpAllowList;
pub use auth::{extract_user_pass, ProxyAuth, CHALLENGE_RESPONSE};
