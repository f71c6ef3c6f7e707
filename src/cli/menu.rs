use anyhow::{Context, Result};
use dialoguer::{Input, Select, theme::ColorfulTheme};
use std::net::SocketAddr;

use crate::cli::Commands;
use crate::network::DEFAULT_TCP_PORT;

/// Startup menu that turns a few prompts into a `host` or `join` command
pub struct InteractiveMenu {
    theme: ColorfulTheme,
}

impl Default for InteractiveMenu {
    fn default() -> Self {
        Self::new()
    }
}

impl InteractiveMenu {
    pub fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }

    /// Returns `None` when the user quits
    pub fn run(&self) -> Result<Option<Commands>> {
        let menu_items = vec!["🎮 Host a lobby", "🔍 Join a lobby", "❌ Quit"];

        let selection = Select::with_theme(&self.theme)
            .with_prompt("Choose an option")
            .default(0)
            .items(&menu_items)
            .interact()?;

        match selection {
            0 => self.host_prompts().map(Some),
            1 => self.join_prompts().map(Some),
            _ => Ok(None),
        }
    }

    fn host_prompts(&self) -> Result<Commands> {
        let name: String = Input::with_theme(&self.theme)
            .with_prompt("Lobby name")
            .default("LAN Lobby".to_string())
            .interact_text()?;
        let players: u32 = Input::with_theme(&self.theme)
            .with_prompt("Players (including you)")
            .default(2)
            .interact_text()?;
        let host_name: String = Input::with_theme(&self.theme)
            .with_prompt("Your name")
            .default("Host".to_string())
            .interact_text()?;

        Ok(Commands::Host {
            name,
            players,
            port: DEFAULT_TCP_PORT,
            host_name,
        })
    }

    fn join_prompts(&self) -> Result<Commands> {
        let address: String = Input::with_theme(&self.theme)
            .with_prompt("Host address (leave empty to search)")
            .allow_empty(true)
            .interact_text()?;

        Ok(Commands::Join {
            address: parse_address(&address)?,
        })
    }
}

fn parse_address(input: &str) -> Result<Option<SocketAddr>> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    let addr = input
        .parse::<SocketAddr>()
        .with_context(|| format!("'{}' is not an address like 192.168.1.20:{}", input, DEFAULT_TCP_PORT))?;
    Ok(Some(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("  ").unwrap(), None);
        assert_eq!(
            parse_address("10.0.0.7:45678").unwrap(),
            Some(SocketAddr::from(([10, 0, 0, 7], 45678)))
        );
        assert!(parse_address("10.0.0.7").is_err());
    }
}
