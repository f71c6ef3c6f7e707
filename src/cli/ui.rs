use anyhow::Result;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::game::{Choice, LobbyClient, LobbySession, PlayerEvent, SessionEvent, SessionState, Verdict};
use crate::network::SessionConfig;

/// One line typed at the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleInput {
    Choice(Choice),
    NextRound,
    Quit,
    Unknown,
}

pub fn parse_input(line: &str) -> ConsoleInput {
    let line = line.trim().to_ascii_lowercase();
    match line.as_str() {
        "1" | "r" | "rock" => ConsoleInput::Choice(Choice::Rock),
        "2" | "p" | "paper" => ConsoleInput::Choice(Choice::Paper),
        "3" | "s" | "scissors" => ConsoleInput::Choice(Choice::Scissors),
        "n" | "next" => ConsoleInput::NextRound,
        "q" | "quit" | "exit" => ConsoleInput::Quit,
        _ => ConsoleInput::Unknown,
    }
}

fn print_choice_prompt() {
    println!("\n✊ Round started! Pick your move: 1) Rock  2) Paper  3) Scissors");
}

fn verdict_line(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Win => "🏆 You win!",
        Verdict::Lose => "💀 You lose.",
        Verdict::Draw => "🤝 It's a draw.",
    }
}

fn print_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(SessionState::Listening) => println!("📡 Waiting for players..."),
        SessionEvent::StateChanged(state) => debug!("Session is now {}", state),
        SessionEvent::PlayerJoined(player) => println!("👋 {} joined from {}", player.display_name, player.address),
        SessionEvent::PlayerLeft(player) => println!("🚪 {} left", player.display_name),
        SessionEvent::RoundStarted => print_choice_prompt(),
        SessionEvent::RoundResolved { outcomes, host_verdict } => {
            println!("{}", verdict_line(*host_verdict));
            let winners = outcomes.iter().filter(|o| o.verdict == Verdict::Win).count();
            println!("   {} of {} players won. Type 'n' for another round or 'q' to quit.", winners, outcomes.len());
        }
    }
}

/// Host a lobby until the user quits
pub async fn run_host(config: SessionConfig) -> Result<()> {
    let (mut session, mut events) = LobbySession::new(config);
    session.start_server().await?;

    let descriptor = session.descriptor();
    println!(
        "🎮 Hosting '{}' on port {} for {} players. Type 'q' to quit.",
        descriptor.name, descriptor.tcp_port, descriptor.max_players
    );
    drain(&mut events).iter().for_each(print_session_event);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = session.next_server_event() => match event {
                Some(event) => session.handle_server_event(event),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    ConsoleInput::Choice(choice) => {
                        if let Err(e) = session.submit_host_choice(choice) {
                            println!("Can't play now: {}", e);
                        }
                    }
                    ConsoleInput::NextRound => {
                        if let Err(e) = session.next_round() {
                            println!("No round to restart: {}", e);
                        }
                    }
                    ConsoleInput::Quit => break,
                    ConsoleInput::Unknown => println!("Type 1, 2 or 3 to play, 'n' for a new round, 'q' to quit"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        drain(&mut events).iter().for_each(print_session_event);
    }

    info!("Shutting down lobby");
    session.close().await;
    drain(&mut events).iter().for_each(print_session_event);
    Ok(())
}

/// Join a lobby, directly or through discovery, and play until it closes
pub async fn run_player(discovery_port: u16, address: Option<SocketAddr>) -> Result<()> {
    let (mut client, mut events) = LobbyClient::new(discovery_port);
    match address {
        Some(addr) => {
            println!("🔌 Connecting to {}...", addr);
            client.join(addr).await;
        }
        None => {
            client.search()?;
            println!("🔍 Searching for lobbies on port {}...", discovery_port);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let mut finished = false;
        for event in drain(&mut events) {
            match event {
                PlayerEvent::LobbyFound(found) => println!(
                    "📡 Found '{}' at {} ({}/{})",
                    found.descriptor.name,
                    found.session_addr(),
                    found.descriptor.current_players,
                    found.descriptor.max_players
                ),
                PlayerEvent::Joined(addr) => println!("✅ Joined lobby at {}. Waiting for the round...", addr),
                PlayerEvent::ChoiceRequested => print_choice_prompt(),
                PlayerEvent::RoundFinished(verdict) => {
                    println!("{}", verdict_line(verdict));
                    println!("   Waiting for the host to start another round...");
                }
                PlayerEvent::Left => {
                    println!("🚪 Disconnected from the lobby");
                    finished = true;
                }
                PlayerEvent::Error(reason) => {
                    println!("❌ {}", reason);
                    finished = !client.is_searching();
                }
            }
        }
        if finished {
            break;
        }

        tokio::select! {
            input = client.next_event() => match input {
                Some(input) => client.handle_event(input).await,
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    ConsoleInput::Choice(choice) => {
                        if !client.submit_choice(choice) {
                            println!("Not connected yet");
                        }
                    }
                    ConsoleInput::Quit => break,
                    ConsoleInput::NextRound | ConsoleInput::Unknown => {
                        println!("Type 1, 2 or 3 to play, 'q' to quit")
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close();
    Ok(())
}

fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut pending = Vec::new();
    while let Ok(event) = rx.try_recv() {
        pending.push(event);
    }
    pending
}
