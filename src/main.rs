use anyhow::{bail, Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::style::{Color, Stylize};
use crossterm::terminal;
use std::io::Write;
use tracing_subscriber::EnvFilter;

use faids::cli::{ClientCommand, ClientOpts};
use faids::progress::{size_label, TransferProgress};
use faids::tls::{self, ServerTrust};
use faids::{logging, Client, RelayError};

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        let _ = terminal::disable_raw_mode();
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("install Ctrl-C handler")?;

    let opts = ClientOpts::parse();
    let filter = if opts.debug {
        logging::filter(true)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    logging::init_with(filter, None)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(opts))
}

async fn run(opts: ClientOpts) -> Result<()> {
    let password = resolve_password(&opts)?;
    let trust = if opts.tofu {
        ServerTrust::Tofu { known_hosts: tls::known_hosts_path() }
    } else {
        ServerTrust::AcceptAny
    };

    let mut client = Client::connect_tls(&opts.host, opts.port, &trust).await?;
    client.login(&opts.user, &password).await?;
    println!("{} as {}", "Logged in".with(Color::Green).bold(), opts.user);

    let res = match &opts.command {
        ClientCommand::List => list(&mut client).await,
        ClientCommand::Send { to, file } => send(&mut client, to, file).await,
        ClientCommand::Receive { dir, yes } => receive(&mut client, dir, *yes).await,
    };
    client.close().await;
    res
}

async fn list(client: &mut Client) -> Result<()> {
    let users = client.ready_users().await?;
    if users.is_empty() {
        println!("Nobody is ready to receive right now");
    } else {
        println!("{}", "Ready to receive:".bold());
        for u in users {
            println!("  {}", u.with(Color::Cyan));
        }
    }
    Ok(())
}

async fn send(client: &mut Client, to: &str, file: &std::path::Path) -> Result<()> {
    let size = std::fs::metadata(file)
        .with_context(|| format!("read {}", file.display()))?
        .len();
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    println!("Asking {} to accept {} ({})...", to, name, size_label(size));

    let mut bar: Option<TransferProgress> = None;
    let res = client
        .send_file(to, file, |n| {
            bar.get_or_insert_with(|| TransferProgress::new("Sending", &name, size, true))
                .update(n)
        })
        .await;

    match res {
        Ok(report) => {
            match &bar {
                Some(b) => b.finish(report.transferred, report.expected),
                None => println!("{} {}", "Sent".with(Color::Green).bold(), name),
            }
            Ok(())
        }
        Err(RelayError::TransferIncomplete { transferred, expected }) => {
            if let Some(b) = &bar {
                b.finish(transferred, expected);
            }
            bail!("transfer incomplete: {} of {} delivered", size_label(transferred), size_label(expected))
        }
        Err(RelayError::NegotiationFailure(outcome)) => bail!("{}: {}", to, outcome),
        Err(e) => Err(e.into()),
    }
}

async fn receive(client: &mut Client, dir: &std::path::Path, yes: bool) -> Result<()> {
    client.mark_ready().await?;
    println!("Waiting for an incoming file (Ctrl-C to stop)...");
    let offer = client.next_offer().await?;
    println!(
        "{} wants to send you {}",
        offer.from_user.as_str().with(Color::Cyan).bold(),
        offer.file_name
    );

    let accept = yes || tokio::task::spawn_blocking(|| confirm("Accept? [y/N] ")).await??;
    if !accept {
        client.decline().await?;
        println!("Declined");
        return Ok(());
    }

    let mut bar: Option<TransferProgress> = None;
    let res = client
        .accept(dir, |n, total| {
            bar.get_or_insert_with(|| TransferProgress::new("Receiving", &offer.file_name, total, true))
                .update(n)
        })
        .await;
    match res {
        Ok((path, report)) => {
            if let Some(b) = &bar {
                b.finish(report.transferred, report.expected);
            }
            println!("Saved to {}", path.display());
            Ok(())
        }
        Err(RelayError::TransferIncomplete { transferred, expected }) => {
            if let Some(b) = &bar {
                b.finish(transferred, expected);
            }
            bail!("connection lost after {} of {}", size_label(transferred), size_label(expected))
        }
        Err(e) => Err(e.into()),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn resolve_password(opts: &ClientOpts) -> Result<String> {
    if let Some(p) = &opts.password {
        return Ok(p.clone());
    }
    if let Ok(p) = std::env::var("FAIDS_PASSWORD") {
        return Ok(p);
    }
    read_hidden(&format!("Password for {}: ", opts.user))
}

/// Read a line without echoing it
fn read_hidden(prompt: &str) -> Result<String> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    terminal::enable_raw_mode().context("enable raw mode")?;
    let res = (|| -> Result<String> {
        let mut pw = String::new();
        loop {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Enter => return Ok(pw),
                    KeyCode::Backspace => {
                        pw.pop();
                    }
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        bail!("password entry cancelled")
                    }
                    KeyCode::Esc => bail!("password entry cancelled"),
                    KeyCode::Char(c) => pw.push(c),
                    _ => {}
                }
            }
        }
    })();
    let _ = terminal::disable_raw_mode();
    println!();
    res
}
