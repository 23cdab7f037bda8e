pub mod logging;
pub mod sync_codec;
pub mod timeout;
