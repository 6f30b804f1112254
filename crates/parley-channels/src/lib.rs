pub mod console;
pub mod util;
pub mod whatsapp;

pub use console::ConsoleAdapter;
pub use whatsapp::{parse_webhook, verify_challenge, WhatsAppAdapter};
