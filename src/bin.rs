use std::path::Path;
use std::time::Duration;

use clap::{crate_version, App, Arg};
use tftp_server::{Config, Server};

fn main() {
    env_logger::init();

    let arg_port = "Port";
    let arg_dir = "Directory";
    let arg_timeout = "Timeout";
    let arg_readonly = "Readonly";

    let matches = App::new("tftpd")
        .about("A server implementation of the TFTP Protocol (IETF RFC 1350)")
        .version(crate_version!())
        .arg(
            Arg::with_name(arg_port)
                .short("p")
                .long("port")
                .help("UDP port to listen on")
                .takes_value(true)
                .value_name("PORT"),
        )
        .arg(
            Arg::with_name(arg_dir)
                .short("d")
                .long("directory")
                .help("directory to serve (current directory by default)")
                .takes_value(true)
                .value_name("DIRECTORY"),
        )
        .arg(
            Arg::with_name(arg_timeout)
                .short("t")
                .long("timeout")
                .help("non-zero number of seconds before an idle session is abandoned")
                .takes_value(true)
                .value_name("SECONDS"),
        )
        .arg(
            Arg::with_name(arg_readonly)
                .short("r")
                .long("readonly")
                .help("rejects all write requests"),
        )
        .get_matches();

    let port = matches
        .value_of(arg_port)
        .map(|s| s.parse::<u16>().expect("error parsing port"))
        .unwrap_or(6969);

    let timeout_secs = matches
        .value_of(arg_timeout)
        .map(|s| {
            let n: u64 = s.parse().expect("error parsing timeout");
            assert!(n > 0, "timeout may not be 0 seconds");
            n
        })
        .unwrap_or(2);

    let root_dir = matches
        .value_of(arg_dir)
        .map(|dir| {
            let path = Path::new(dir);
            assert!(path.exists(), "specified path {:?} does not exist", dir);
            path.to_owned()
        })
        .unwrap_or_else(|| Path::new(".").to_owned());

    let config = Config {
        port,
        root_dir,
        readonly: matches.is_present(arg_readonly),
        session_timeout: Duration::from_secs(timeout_secs),
    };

    let server = Server::bind(config).expect("error creating server");
    match server.run() {
        Ok(()) => println!("server shut down cleanly"),
        Err(e) => {
            eprintln!("server error: {:?}", e);
            std::process::exit(1);
        }
    }
}
