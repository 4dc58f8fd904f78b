pub mod meta;
pub mod meta_token;
pub mod render;
pub mod ssotica;
