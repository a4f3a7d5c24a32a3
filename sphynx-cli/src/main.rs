pub mod exitcode;
pub mod logging;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Arg, ArgMatches, Command};

use sphynx_server::{KeyFile, Server, Settings};

struct Flags {
    base_path: PathBuf,
}

fn parse_flags(global_args: &ArgMatches) -> Flags {
    let base_path = global_args.value_of("base_path").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    Flags { base_path }
}

async fn run_serve(flags: Flags, args: &ArgMatches) -> i32 {
    let settings = match args.value_of("config") {
        Some(path) => match Settings::from_file(Path::new(path)) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("sphynx: {e}");
                return exitcode::ERR_STARTUP;
            }
        },
        None => Settings::default(),
    };
    logging::init(settings.log_level);

    let key_path = flags.base_path.join("KeyPair.bin");
    let keypair = match KeyFile::load(&key_path) {
        Ok(k) => k,
        Err(_) => match KeyFile::generate_and_save(&key_path) {
            Ok(k) => k,
            Err(e) => {
                eprintln!("sphynx: cannot create {}: {e}", key_path.display());
                return exitcode::ERR_STARTUP;
            }
        },
    };

    let bind_addr: SocketAddr = match args.value_of("listen").unwrap_or("0.0.0.0:9000").parse() {
        Ok(a) => a,
        Err(_) => {
            eprintln!("sphynx: invalid --listen address");
            return exitcode::ERR_USAGE;
        }
    };

    let (server, mut inbound) = match Server::bind(bind_addr, keypair, settings).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("sphynx: failed to bind {bind_addr}: {e}");
            return exitcode::ERR_STARTUP;
        }
    };
    tracing::info!(addr = %server.local_addr().unwrap(), "sphynx server listening");

    tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            tracing::debug!(from = %msg.from, stream = msg.stream, len = msg.payload.len(), "message delivered");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    exitcode::OK
}

fn run_keygen(path: &Path) -> i32 {
    match KeyFile::generate_and_save(path) {
        Ok(keypair) => {
            println!("wrote {}", path.display());
            println!("public key: {}", hex_encode(&keypair.public().to_bytes()));
            exitcode::OK
        }
        Err(e) => {
            eprintln!("sphynx: {e}");
            exitcode::ERR_STARTUP
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn async_main(flags: Flags, global_args: Box<ArgMatches>) -> i32 {
    match global_args.subcommand() {
        Some(("serve", args)) => run_serve(flags, args).await,
        Some(("keygen", args)) => {
            let path = args.value_of("output").map(PathBuf::from).unwrap_or_else(|| flags.base_path.join("KeyPair.bin"));
            run_keygen(&path)
        }
        Some(("connect", _args)) => {
            eprintln!("sphynx: connect is not yet wired into the CLI, link against sphynx_server::Client directly");
            exitcode::ERR_GENERIC
        }
        _ => {
            eprintln!("sphynx: no subcommand given, try --help");
            exitcode::ERR_USAGE
        }
    }
}

fn main() {
    let app = Command::new("sphynx")
        .about("Secure reliable datagram transport")
        .disable_version_flag(true)
        .arg(Arg::new("base_path").long("base-path").short('b').takes_value(true).help("directory holding KeyPair.bin and Settings.cfg"))
        .subcommand(
            Command::new("serve")
                .about("run a Sphynx server")
                .arg(Arg::new("listen").long("listen").short('l').takes_value(true).help("UDP address to bind, default 0.0.0.0:9000"))
                .arg(Arg::new("config").long("config").short('c').takes_value(true).help("path to a Settings.cfg file")),
        )
        .subcommand(
            Command::new("keygen")
                .about("generate a new long-term keypair")
                .arg(Arg::new("output").long("output").short('o').takes_value(true).help("where to write KeyPair.bin")),
        )
        .subcommand(Command::new("connect").about("connect to a Sphynx server").arg(Arg::new("server").required(true)));

    let global_args = match app.try_get_matches_from(std::env::args()) {
        Ok(m) => Box::new(m),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(exitcode::ERR_USAGE);
        }
    };
    let flags = parse_flags(&global_args);

    std::process::exit(tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap().block_on(async_main(flags, global_args)));
}
