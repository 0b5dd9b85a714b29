pub(crate) mod dolphin;
pub(crate) mod zai;

pub use dolphin::{DolphinClient, DolphinConfig, build_dolphin_payload};
pub use zai::{ZaiClient, ZaiConfig, build_zai_payload};
