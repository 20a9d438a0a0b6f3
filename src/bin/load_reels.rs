#[cfg(feature = "ssr")]
use diesel::Connection;
#[cfg(feature = "ssr")]
use reel_vote::{catalog::ReelCatalog, config::Config, establish_connection, upsert_reel};

// Usage: load_reels [reels.json]   (defaults to REELS_FILE)
#[cfg(feature = "ssr")]
fn main() {
    let config = Config::load().expect("Invalid configuration");
    let path = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .or(config.reels_file.clone())
        .expect("Pass a reels JSON file or set REELS_FILE");

    let catalog = ReelCatalog::from_file(&path).expect("Failed to read reels");
    let mut conn = establish_connection(&config).expect("Failed to open database");
    conn.transaction(|conn| {
        for reel in catalog.reels() {
            upsert_reel(conn, reel)?;
        }
        Ok::<_, diesel::result::Error>(())
    })
    .expect("Failed to load reels");

    println!(
        "Loaded {} reels in {} categories from {}.",
        catalog.len(),
        catalog.categories().len(),
        path.display()
    );
}

#[cfg(not(feature = "ssr"))]
fn main() {
    println!("This binary requires the 'ssr' feature to be enabled.");
}
