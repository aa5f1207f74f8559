//! Cookie session keys.

pub const USER_ID: &str = "user_id";
pub const RETURN_URL: &str = "return_url";
