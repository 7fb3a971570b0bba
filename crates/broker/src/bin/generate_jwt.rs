//! Token issuance utility
//!
//! Signs an RS256 bearer token for one subject and a set of allowed tags.
//! The private key is read from `MCP_JWT_PRIVATE_KEY_PATH` or the default
//! config dir, and must be mode 0600 or 0400.
//!
//! Usage:
//!   generate_jwt <subject> <tag,tag,...> [days]
//!   generate_jwt alice 'calendars,private'
//!   generate_jwt ci-bot '*' 7

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use mcp_broker::auth::jwt::DEFAULT_TOKEN_LIFETIME_DAYS;
use mcp_broker::config;
use mcp_broker::TokenIssuer;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let (subject, tags_arg) = match (args.first(), args.get(1)) {
        (Some(subject), Some(tags)) => (subject.clone(), tags.clone()),
        _ => {
            eprintln!("Usage: generate_jwt <subject> <tag,tag,...> [days]");
            eprintln!("Example: generate_jwt alice 'calendars,private' 30");
            return ExitCode::FAILURE;
        }
    };

    let lifetime_days = match args.get(2) {
        Some(raw) => match raw.parse::<i64>() {
            Ok(days) if days > 0 => days,
            _ => {
                eprintln!("Error: days must be a positive integer");
                return ExitCode::FAILURE;
            }
        },
        None => DEFAULT_TOKEN_LIFETIME_DAYS,
    };

    let allowed_tags: Vec<String> = tags_arg
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if allowed_tags.is_empty() {
        eprintln!("Error: at least one tag is required ('*' grants everything)");
        return ExitCode::FAILURE;
    }

    let key_path = env::var("MCP_JWT_PRIVATE_KEY_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config::default_config_dir().join("jwt_private.pem"));

    let issuer = match TokenIssuer::from_pem_file(&key_path) {
        Ok(issuer) => issuer,
        Err(e) => {
            eprintln!("Error: {} ({})", e, key_path.display());
            eprintln!("Generate a keypair with:");
            eprintln!("  openssl genrsa -out jwt_private.pem 2048");
            eprintln!("  openssl rsa -in jwt_private.pem -pubout -out jwt_public.pem");
            eprintln!("  chmod 600 jwt_private.pem");
            return ExitCode::FAILURE;
        }
    };

    match issuer.issue(&subject, &allowed_tags, lifetime_days) {
        Ok(token) => {
            println!("{}", token);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
