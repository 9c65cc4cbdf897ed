//! Mint a bearer token signed with the gateway's `JWT_SECRET`.
//!
//! Usage: `issue-token <user_id> <role> [ttl_secs]`

use std::path::Path;

use rt_gateway::auth::principal::Role;
use rt_gateway::auth::tokens::TokenIssuer;
use rt_gateway::config::Config;

const DEFAULT_TTL_SECS: i64 = 3600;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let mut args = std::env::args().skip(1);
    let (Some(user_id), Some(role)) = (args.next(), args.next()) else {
        eprintln!("usage: issue-token <user_id> <role> [ttl_secs]");
        std::process::exit(2);
    };
    let role: Role = role
        .parse()
        .map_err(|_| format!("unknown role '{role}'"))?;
    let ttl_secs = match args.next() {
        Some(ttl) => ttl.parse::<i64>()?,
        None => DEFAULT_TTL_SECS,
    };

    let config = Config::from_lookup(|name| std::env::var(name).ok())?;
    let token = TokenIssuer::new(&config.jwt_secret).issue(&user_id, role, ttl_secs);
    println!("{token}");
    Ok(())
}
