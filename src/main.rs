use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use spf_policy::identity::DnsIdentityResolver;
use spf_policy::{ExpansionMode, MacroExpander, SpfConfig, SpfContext, SpfEvaluator, SpfResult};
use std::net::IpAddr;
use std::process;
use std::sync::Arc;

fn main() {
    let matches = Command::new("spf-policy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Evaluate SPF authorization for a sending host")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/spf-policy.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ip")
                .long("ip")
                .value_name("ADDRESS")
                .help("IP address of the connecting host")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("helo")
                .long("helo")
                .value_name("NAME")
                .help("HELO/EHLO name given by the client")
                .default_value(""),
        )
        .arg(
            Arg::new("sender")
                .long("sender")
                .value_name("ADDRESS")
                .help("Envelope sender (MAIL FROM)")
                .default_value(""),
        )
        .arg(
            Arg::new("expand")
                .long("expand")
                .value_name("TEMPLATE")
                .help("Expand a macro template against --ip/--helo/--sender and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("explanation")
                .long("explanation")
                .help("Expand --expand templates as explanation text instead of a domain")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the outcome as JSON")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/spf-policy.yaml");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    let evaluator = match SpfEvaluator::from_config(&config) {
        Ok(evaluator) => evaluator,
        Err(e) => {
            eprintln!("❌ Configuration validation failed: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Number of records: {}", config.records.len());
        println!("Number of rewrites: {}", config.rewrites.len());
        println!("Policy stages: {}", evaluator.chain().stage_names().join(", "));
        println!("✅ Configuration validated");
        return;
    }

    let ip = match parse_ip(&matches) {
        Ok(ip) => ip,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(2);
        }
    };
    let helo = matches.get_one::<String>("helo").map(String::as_str).unwrap_or("");
    let sender = matches.get_one::<String>("sender").map(String::as_str).unwrap_or("");

    if let Some(template) = matches.get_one::<String>("expand") {
        expand_template(&config, template, ip, helo, sender, matches.get_flag("explanation"));
        return;
    }

    let outcome = evaluator.evaluate(ip, helo, sender);

    if matches.get_flag("json") {
        match serde_json::to_string_pretty(&outcome) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing outcome: {e}");
                process::exit(1);
            }
        }
    } else {
        println!("{} ({})", outcome.result, outcome.domain);
        if let Some(explanation) = &outcome.explanation {
            println!("explanation: {explanation}");
        }
        if outcome.result == SpfResult::TempError {
            println!("temporary failure, retry later");
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<SpfConfig> {
    if std::path::Path::new(path).exists() {
        SpfConfig::load_from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(SpfConfig::default())
    }
}

fn generate_default_config(path: &str) {
    match SpfConfig::default().save_to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_ip(matches: &ArgMatches) -> anyhow::Result<IpAddr> {
    let text = matches
        .get_one::<String>("ip")
        .ok_or_else(|| anyhow::anyhow!("--ip is required"))?;
    text.parse()
        .map_err(|e| anyhow::anyhow!("Invalid IP address '{text}': {e}"))
}

fn expand_template(
    config: &SpfConfig,
    template: &str,
    ip: IpAddr,
    helo: &str,
    sender: &str,
    explanation: bool,
) {
    let mode = if explanation {
        ExpansionMode::Explanation
    } else {
        ExpansionMode::Macro
    };
    let ctx = SpfContext::new(ip, helo, sender).with_receiving_domain(config.receiving_domain.clone());

    let expander = if config.dns.identity_lookup {
        match DnsIdentityResolver::new(config.dns.timeout_seconds) {
            Ok(resolver) => MacroExpander::new(Some(Arc::new(resolver))),
            Err(e) => {
                eprintln!("Error creating DNS resolver: {e:#}");
                process::exit(1);
            }
        }
    } else {
        MacroExpander::default()
    };

    match expander.expand(template, &ctx, mode) {
        Ok(expanded) => println!("{expanded}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
