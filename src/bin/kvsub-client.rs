//! the interactive kvsub client
//!
//! `kvsub-client <CLIENT_ID> <REGISTER_FIFO>`
//!
//! Creates `/tmp/req<id>`, `/tmp/resp<id>` and `/tmp/notif<id>`, connects a
//! session through the server's registration FIFO, then reads commands from
//! stdin:
//!
//!     SUBSCRIBE <key>
//!     UNSUBSCRIBE <key>
//!     DELAY <ms>
//!     DISCONNECT
//!
//! Notifications for subscribed keys are printed as they arrive, in their
//! wire form: `(key,value)` on change, `(key,DELETED)` on delete.

use std::io::BufRead;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{crate_version, App, Arg};
use kvsub::parser::{parse_client_line, ClientCommand};
use kvsub::Client;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn main() -> anyhow::Result<()> {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let matches = App::new("kvsub-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("interactive client for the kvsub server")
        .arg(
            Arg::with_name("CLIENT_ID")
                .required(true)
                .index(1)
                .help("unique id used to name this client's FIFOs"),
        )
        .arg(
            Arg::with_name("REGISTER_FIFO")
                .required(true)
                .index(2)
                .help("path of the server's registration FIFO"),
        )
        .get_matches();

    let id = matches.value_of("CLIENT_ID").unwrap();
    let register = PathBuf::from(matches.value_of("REGISTER_FIFO").unwrap());
    let req_path = PathBuf::from(format!("/tmp/req{}", id));
    let resp_path = PathBuf::from(format!("/tmp/resp{}", id));
    let notif_path = PathBuf::from(format!("/tmp/notif{}", id));

    let mut client = Client::connect(&register, &req_path, &resp_path, &notif_path)
        .context("Could not connect to server!")?;
    println!("Server returned 0 for operation: CONNECT");

    // print notifications as they arrive, independent of the command loop
    let events = client.notifications().clone();
    let printer = thread::spawn(move || {
        while let Ok(event) = events.recv() {
            print!("{}", event.encode());
        }
    });

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match parse_client_line(&line) {
            ClientCommand::Subscribe(key) => {
                if client.subscribe(&key)? {
                    println!("Server returned 1 for operation: SUBSCRIBE");
                } else {
                    println!("Server returned 0 for operation: SUBSCRIBE");
                    eprintln!("Could not subscribe to key! (Key not Found)");
                }
            }
            ClientCommand::Unsubscribe(key) => {
                if client.unsubscribe(&key)? {
                    println!("Server returned 0 for operation: UNSUBSCRIBE");
                } else {
                    println!("Server returned 1 for operation: UNSUBSCRIBE");
                    eprintln!("Could not unsubscribe to key!");
                }
            }
            ClientCommand::Delay(ms) => {
                if ms > 0 {
                    println!("Waiting...");
                    thread::sleep(Duration::from_millis(ms));
                }
            }
            ClientCommand::Disconnect => {
                client.disconnect()?;
                println!("Server returned 0 for operation: DISCONNECT");
                println!("Disconnected from server");
                let _ = printer.join();
                return Ok(());
            }
            ClientCommand::Empty => {}
            ClientCommand::Invalid => {
                eprintln!("Invalid command. See HELP for usage");
            }
        }
    }

    // stdin ended without a DISCONNECT: end the session anyway
    client.disconnect()?;
    let _ = printer.join();
    Ok(())
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
