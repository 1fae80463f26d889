//! Built-in task handlers.

mod command;
mod vault_section;

pub use command::CommandHandler;
pub use vault_section::VaultSectionHandler;
