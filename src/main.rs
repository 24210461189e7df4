use std::env;
use std::process::ExitCode;

use stream_webrtc::server;

const DEFAULT_CONFIG: &str = "config.json";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("server") => {
            let config = args.get(2).map(String::as_str).unwrap_or(DEFAULT_CONFIG);
            match server::main(config) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Server error: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
        _ => {
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!("Stream WebRTC");
    println!("Usage:");
    println!("  stream-webrtc server [config.json]  - Serve WebRTC viewers of the configured streams");
}
