mod types;

pub use types::{ChatLine, GameEvent, MAX_CHAT_LEN, truncate_chat};
