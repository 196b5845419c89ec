//! CLI entrypoint for the ferroeid conformance harness.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use ferroeid_core::Protocol;
use ferroeid_harness::fixtures::FixtureSet;
use ferroeid_harness::{script, Reader};

/// Conformance tooling for the ferroeid card core.
#[derive(Debug, Parser)]
#[command(name = "ferroeid-harness")]
#[command(about = "Drive an in-process ferroeid card with APDU scripts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a hex APDU script against a fresh card.
    Run {
        /// Script file path.
        #[arg(long)]
        script: PathBuf,
        /// Use the byte-oriented T=0 protocol instead of T=1.
        #[arg(long)]
        t0: bool,
        /// Personalize (PIN 1, activate) before the script runs.
        #[arg(long)]
        personalize: bool,
    },
    /// Run every case of a JSON fixture set.
    Verify {
        /// Fixture JSON path.
        #[arg(long)]
        fixture: PathBuf,
    },
    /// Personalize a fresh card and print the resulting state.
    Personalize {
        /// PIN 1 value (up to 8 bytes, ASCII).
        #[arg(long, default_value = "1111")]
        pin: String,
        /// PUK 1 value.
        #[arg(long, default_value = "2222")]
        puk: String,
    },
    /// Print card identification data.
    Info,
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Run {
            script: path,
            t0,
            personalize,
        } => {
            let text = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
            let protocol = if t0 { Protocol::T0 } else { Protocol::T1 };
            let mut reader = Reader::new(protocol);
            if personalize {
                reader
                    .personalize(b"1111", b"2222")
                    .map_err(|sw| format!("personalization failed with SW {sw}"))?;
            }
            let steps = script::run(&mut reader, &text).map_err(|e| e.to_string())?;
            for step in &steps {
                if step.sent.is_empty() {
                    println!("reset");
                } else {
                    println!("> {}", hex::encode(&step.sent));
                    println!("< {}", hex::encode(&step.response));
                }
            }
            println!("{} steps ok", steps.len());
            Ok(())
        }
        Command::Verify { fixture } => {
            let set = FixtureSet::from_file(&fixture).map_err(|e| e.to_string())?;
            let mut failures = 0usize;
            for case in &set.cases {
                let protocol = if case.protocol.eq_ignore_ascii_case("T0") {
                    Protocol::T0
                } else {
                    Protocol::T1
                };
                let mut reader = Reader::new(protocol);
                let text = case.script.join("\n");
                match script::run(&mut reader, &text) {
                    Ok(_) => println!("PASS {}::{}", set.family, case.name),
                    Err(e) => {
                        failures += 1;
                        println!("FAIL {}::{} — {e}", set.family, case.name);
                    }
                }
            }
            if failures == 0 {
                Ok(())
            } else {
                Err(format!("{failures} fixture case(s) failed"))
            }
        }
        Command::Personalize { pin, puk } => {
            let mut reader = Reader::new(Protocol::T1);
            reader
                .personalize(pin.as_bytes(), puk.as_bytes())
                .map_err(|sw| format!("personalization failed with SW {sw}"))?;
            println!("lifecycle: {}", reader.card().lifecycle());
            println!("change counter: {}", reader.card().change_counter());
            Ok(())
        }
        Command::Info => {
            let mut reader = Reader::new(Protocol::T1);
            let (id, sw) = reader.exchange(&[0x00, 0xCA, 0x01, 0xA0, 0x14]);
            if sw != ferroeid_core::StatusWord::OK {
                return Err(format!("GET DATA failed with SW {sw}"));
            }
            println!("card id: {}", hex::encode(id));
            let (caps, _) = reader.exchange(&[0x00, 0xCA, 0x01, 0xAA, 0x0B]);
            println!("capabilities: {}", hex::encode(caps));
            Ok(())
        }
    }
}
