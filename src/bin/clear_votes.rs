#[cfg(feature = "ssr")]
use reel_vote::{clear_votes, config::Config, establish_connection};

#[cfg(feature = "ssr")]
fn main() {
    let config = Config::load().expect("Invalid configuration");
    let mut conn = establish_connection(&config).expect("Failed to open database");
    let deleted = clear_votes(&mut conn).expect("Failed to clear votes");
    println!("Cleared {deleted} votes and every aggregate.");
}

#[cfg(not(feature = "ssr"))]
fn main() {
    println!("This binary requires the 'ssr' feature to be enabled.");
}
