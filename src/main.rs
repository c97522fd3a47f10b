use std::{
    env, fmt,
    net::{IpAddr, Ipv6Addr},
    process,
    str::FromStr,
};

mod ikev1;
mod logger;

enum Action {
    Serve(ikev1::Config),
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: ikesessiond [OPTIONS] serve\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --listen-ip=<IP>                 Listen IP address, multiple options can be provided [default: ::]\
\n      --port=<PORT>                    ISAKMP port [default: 500]\
\n      --nat-port=<PORT>                NAT-T port [default: 4500]\
\n      --ike-proposal=<PROPOSAL>        Phase 1 proposal, multiple options can be provided [default: aes256-sha256-modp2048-psk]\
\n      --ike-lifetime=<SECONDS>         Phase 1 lifetime [default: 28800]\
\n      --proposal-check=<LEVEL>         Lifetime check level: obey, strict, claim or exact [default: strict]\
\n      --idle-timeout=<SECONDS>         Idle timeout, 0 to disable [default: 0]\
\n      --idle-direction=<DIRECTION>     Traffic direction for idle detection: inbound, outbound or any [default: any]\
\n      --dpd-interval=<SECONDS>         Dead peer detection interval, 0 to disable [default: 0]\
\n      --dpd-algorithm=<ALGORITHM>      DPD algorithm: default, inbound-detect or blackhole-detect [default: default]\
\n      --verbose-proposals=<BOOL>       Log every mismatched proposal field [default: false]\
\n      --fragmentation=<BOOL>           Fragment oversized replies [default: true]\
\n      --help                           Print help";

const DEFAULT_PROPOSAL: &str = "aes256-sha256-modp2048-psk";

impl Args {
    fn parse() -> Args {
        let fail_with_error = |name: &str, value: &str, err: fmt::Arguments| {
            eprintln!(
                "Argument {} has an unsupported value {}: {}",
                name, value, err
            );
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };
        let parse_number = |name: &str, value: &str| -> u32 {
            match u32::from_str(value) {
                Ok(number) => number,
                Err(err) => {
                    fail_with_error(name, value, format_args!("Failed to parse number: {}", err));
                    process::exit(2);
                }
            }
        };
        let parse_bool = |name: &str, value: &str| -> bool {
            match bool::from_str(value) {
                Ok(flag) => flag,
                Err(err) => {
                    fail_with_error(name, value, format_args!("Failed to parse flag: {}", err));
                    process::exit(2);
                }
            }
        };

        let mut log_level = log::LevelFilter::Info;
        let mut listen_ips = vec![];
        let mut port = 500u16;
        let mut nat_port = 4500u16;
        let mut proposals = vec![];
        let mut lifetime = 28800;
        let mut remote = ikev1::RemoteConfig::default();

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            }
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };

            if name == "--log-level" {
                log_level = match value.to_uppercase().as_str() {
                    "TRACE" => log::LevelFilter::Trace,
                    "DEBUG" => log::LevelFilter::Debug,
                    "INFO" => log::LevelFilter::Info,
                    "WARN" => log::LevelFilter::Warn,
                    "ERROR" => log::LevelFilter::Error,
                    "OFF" => log::LevelFilter::Off,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported log level"));
                        process::exit(2);
                    }
                };
            } else if name == "--listen-ip" {
                match IpAddr::from_str(value) {
                    Ok(ip) => {
                        listen_ips.push(ip);
                    }
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IP address: {}", err),
                    ),
                };
            } else if name == "--port" || name == "--nat-port" {
                let parsed = match u16::from_str(value) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Failed to parse port: {}", err));
                        process::exit(2);
                    }
                };
                if name == "--port" {
                    port = parsed;
                } else {
                    nat_port = parsed;
                }
            } else if name == "--ike-proposal" {
                proposals.push(value.to_string());
            } else if name == "--ike-lifetime" {
                lifetime = parse_number(name, value);
            } else if name == "--proposal-check" {
                match ikev1::CheckLevel::from_str(value) {
                    Ok(check_level) => remote.check_level = check_level,
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                };
            } else if name == "--idle-timeout" {
                remote.idle_timeout = parse_number(name, value);
            } else if name == "--idle-direction" {
                match ikev1::IdleDirection::from_str(value) {
                    Ok(direction) => remote.idle_direction = direction,
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                };
            } else if name == "--dpd-interval" {
                remote.dpd_interval = parse_number(name, value);
            } else if name == "--dpd-algorithm" {
                match ikev1::DpdAlgorithm::from_str(value) {
                    Ok(algorithm) => remote.dpd_algorithm = algorithm,
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                };
            } else if name == "--verbose-proposals" {
                remote.verbose_proposals = parse_bool(name, value);
            } else if name == "--fragmentation" {
                remote.fragmentation = parse_bool(name, value);
            } else {
                eprintln!("Unsupported argument {}", arg);
            }
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        match action.as_str() {
            "serve" => {
                if listen_ips.is_empty() {
                    listen_ips = vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED)];
                }
                if proposals.is_empty() {
                    proposals.push(DEFAULT_PROPOSAL.to_string());
                }
                for (i, proposal) in proposals.iter().enumerate() {
                    match ikev1::parse_ike_proposal(proposal, lifetime) {
                        Ok(mut sa) => {
                            sa.trns_no = (i + 1).min(u8::MAX as usize) as u8;
                            remote.proposals.push(sa);
                        }
                        Err(err) => {
                            fail_with_error("--ike-proposal", proposal, format_args!("{}", err))
                        }
                    }
                }

                let action = Action::Serve(ikev1::Config {
                    port,
                    nat_port,
                    listen_ips,
                    remote,
                });
                Args { log_level, action }
            }
            _ => {
                eprintln!("No action specified");
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        }
    }
}

fn main() {
    println!(
        "ikesessiond version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    match args.action {
        Action::Serve(config) => {
            let server = match ikev1::Server::new(config) {
                Ok(server) => server,
                Err(err) => {
                    println!("Failed to create server, error is {}", err);
                    std::process::exit(1)
                }
            };
            if let Err(err) = server.run() {
                println!("Failed to run server, error is {}", err);
                std::process::exit(1);
            }
        }
    }
}
