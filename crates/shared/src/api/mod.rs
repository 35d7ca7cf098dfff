pub mod base64_serde;
pub mod key_record;
pub mod relay;
