//! A thin line-oriented terminal client: prints the default channel,
//! answers input requests from stdin, runs the loading spinner, and
//! maps Ctrl-C to the interrupt channel. The richer prompt UI lives
//! outside this crate; this is the minimum a session needs to talk to
//! a human.

use std::io::Write;

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::session::stream::{Channel, MessageSource, SessionBus, StreamMessage};

fn print_message(message: &StreamMessage) {
    let text = message.text();
    let rendered = match message.color() {
        Some("red") => format!("{}", text.red()),
        Some("green") => format!("{}", text.green()),
        Some("yellow") => format!("{}", text.yellow()),
        Some("cyan") => format!("{}", text.cyan()),
        Some("blue") => format!("{}", text.bright_blue()),
        _ => text,
    };
    // Render events carry their own newlines; colored notices don't
    if rendered.ends_with('\n') {
        print!("{rendered}");
    } else {
        println!("{rendered}");
    }
    let _ = std::io::stdout().flush();
}

fn spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .expect("static template is valid"),
    );
    bar.set_message("thinking...");
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar
}

/// Run the client until the session says goodbye. Owns stdin.
pub async fn run(bus: SessionBus) {
    let mut default_rx = bus.listen(Channel::Default);
    let mut input_rx = bus.listen(Channel::InputRequest);
    let mut loading_rx = bus.listen(Channel::Loading);
    let mut exit_rx = bus.listen(Channel::ClientExit);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut pending_input: Option<u64> = None;
    let mut active_spinner: Option<ProgressBar> = None;
    let mut interrupt_sent = false;

    loop {
        tokio::select! {
            message = default_rx.recv() => {
                let Some(message) = message else { break };
                if let Some(bar) = &active_spinner {
                    bar.suspend(|| print_message(&message));
                } else {
                    print_message(&message);
                }
            }
            message = input_rx.recv() => {
                let Some(message) = message else { break };
                pending_input = Some(message.id);
                print!("{} ", ">".bright_blue());
                let _ = std::io::stdout().flush();
            }
            message = loading_rx.recv() => {
                let Some(message) = message else { break };
                match message.text().as_str() {
                    "start" => {
                        if active_spinner.is_none() {
                            active_spinner = Some(spinner());
                        }
                    }
                    _ => {
                        if let Some(bar) = active_spinner.take() {
                            bar.finish_and_clear();
                        }
                    }
                }
            }
            line = stdin.next_line(), if pending_input.is_some() => {
                let id = pending_input.take().expect("guarded by condition");
                let text = line.ok().flatten().unwrap_or_else(|| "q".to_string());
                bus.send(text, Channel::InputResponse(id), MessageSource::Client);
            }
            signal = tokio::signal::ctrl_c() => {
                if signal.is_err() {
                    break;
                }
                if interrupt_sent {
                    // Second Ctrl-C during shutdown force-exits
                    std::process::exit(130);
                }
                interrupt_sent = true;
                bus.send("", Channel::Interrupt, MessageSource::Client);
            }
            _ = exit_rx.recv() => {
                break;
            }
        }

        // A finished turn re-arms Ctrl-C
        if interrupt_sent && pending_input.is_some() {
            interrupt_sent = false;
        }
    }

    if let Some(bar) = active_spinner.take() {
        bar.finish_and_clear();
    }
}
