//! Tiny CLI front-end for a running driver's JSON-RPC introspection socket
//! (`rnvme::rpc::RpcServer`): list live queue pairs or reseed the process
//! RNG without attaching a debugger.

use std::env;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::process::ExitCode;

use serde_json::{json, Value};

fn usage() -> ! {
    eprintln!(
        "usage: nvme-cli <socket-path> <command> [args...]\n\
         commands:\n\
         \u{20}  list-qpair\n\
         \u{20}  srand <seed>\n\
         \u{20}  current-seed"
    );
    std::process::exit(2);
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
    }
    let socket_path = &args[1];
    let command = args[2].as_str();

    let (method, params) = match command {
        "list-qpair" => ("list_all_qpair", json!({})),
        "srand" => {
            if args.len() != 4 {
                usage();
            }
            let seed: u64 = match args[3].parse() {
                Ok(s) => s,
                Err(_) => {
                    eprintln!("seed must be an unsigned integer");
                    return ExitCode::FAILURE;
                }
            };
            ("srand", json!({ "seed": seed }))
        }
        "current-seed" => ("current_seed", json!({})),
        other => {
            eprintln!("unknown command: {other}");
            usage();
        }
    };

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    match call(socket_path, &request) {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("nvme-cli: {err}");
            ExitCode::FAILURE
        }
    }
}

fn call(socket_path: &str, request: &Value) -> std::io::Result<Value> {
    let mut stream = UnixStream::connect(socket_path)?;
    let mut line = serde_json::to_string(request).expect("request always serializes");
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;
    serde_json::from_str(response_line.trim_end())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
