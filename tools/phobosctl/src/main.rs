// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! phobosctl: poke a running LRS daemon over its request socket.
//!
//! ```bash
//! phobosctl ping
//! phobosctl monitor dir
//! phobosctl configure-get lrs policy
//! phobosctl configure-set lrs policy first_fit
//! phobosctl --socket /run/phobosd/lrs monitor tape
//! ```

use clap::{Parser, Subcommand};
use phobos_lrs::protocol::{
    pack_request, unpack_response, ConfigEntry, ConfigureOp, ConfigureReq, FrameCodec, MonitorReq,
    Request, Response,
};
use phobos_lrs::types::Family;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "phobosctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Request socket of the daemon
    #[arg(long, default_value = "/run/phobosd/lrs")]
    socket: PathBuf,

    /// Response timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Liveness check
    Ping,
    /// Print a family's device and scheduler status
    Monitor {
        /// Family to inspect (dir, tape, rados_pool)
        family: String,
    },
    /// Read a configuration key
    ConfigureGet { section: String, key: String },
    /// Write a configuration key into the DSS-backed store
    ConfigureSet {
        section: String,
        key: String,
        value: String,
    },
}

fn exchange(args: &Args, request: &Request) -> Result<Response, String> {
    let mut stream =
        UnixStream::connect(&args.socket).map_err(|e| format!("connect {}: {}", args.socket.display(), e))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(args.timeout)))
        .map_err(|e| e.to_string())?;

    let token = std::process::id() as u64;
    let frame = FrameCodec::encode(&pack_request(token, request));
    stream.write_all(&frame).map_err(|e| e.to_string())?;

    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .map_err(|e| format!("read: {}", e))?;
    let mut payload = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
    stream
        .read_exact(&mut payload)
        .map_err(|e| format!("read: {}", e))?;

    let (echoed, response) = unpack_response(&payload).map_err(|e| e.to_string())?;
    if echoed != token {
        return Err(format!("token mismatch: sent {}, got {}", token, echoed));
    }
    Ok(response)
}

fn run(args: &Args) -> Result<(), String> {
    let request = match &args.command {
        Command::Ping => Request::Ping,
        Command::Monitor { family } => {
            let family = Family::from_str(family)
                .ok_or_else(|| format!("unknown family '{}'", family))?;
            Request::Monitor(MonitorReq { family })
        }
        Command::ConfigureGet { section, key } => Request::Configure(ConfigureReq {
            op: ConfigureOp::Get,
            entries: vec![ConfigEntry {
                section: section.clone(),
                key: key.clone(),
                value: None,
            }],
        }),
        Command::ConfigureSet {
            section,
            key,
            value,
        } => Request::Configure(ConfigureReq {
            op: ConfigureOp::Set,
            entries: vec![ConfigEntry {
                section: section.clone(),
                key: key.clone(),
                value: Some(value.clone()),
            }],
        }),
    };

    match exchange(args, &request)? {
        Response::Ping => {
            println!("daemon is alive");
            Ok(())
        }
        Response::Monitor { status } => {
            // Pretty-print when the status is valid JSON, else raw.
            match serde_json::from_str::<serde_json::Value>(&status) {
                Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or(status)),
                Err(_) => println!("{}", status),
            }
            Ok(())
        }
        Response::Configure { entries } => {
            for e in entries {
                match e.value {
                    Some(v) => println!("[{}] {} = {}", e.section, e.key, v),
                    None => println!("[{}] {} is not set", e.section, e.key),
                }
            }
            Ok(())
        }
        Response::Error { kind, code, medium } => {
            let mut msg = format!("daemon error {}", code);
            if let Some(kind) = kind {
                msg.push_str(&format!(" on {} request", kind));
            }
            if let Some(medium) = medium {
                msg.push_str(&format!(" (medium {})", medium));
            }
            Err(msg)
        }
        other => Err(format!("unexpected response {:?}", other)),
    }
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("phobosctl: {}", e);
        std::process::exit(1);
    }
}
