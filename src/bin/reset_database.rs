#[cfg(feature = "ssr")]
use reel_vote::{config::Config, establish_connection, reset_database};

#[cfg(feature = "ssr")]
fn main() {
    let config = Config::load().expect("Invalid configuration");
    let mut conn = establish_connection(&config).expect("Failed to open database");
    reset_database(&mut conn).expect("Failed to reset database");
    println!("Database has been reset: votes, aggregates and voters deleted, tokens released.");
}

#[cfg(not(feature = "ssr"))]
fn main() {
    println!("This binary requires the 'ssr' feature to be enabled.");
}
