#[cfg(feature = "ssr")]
use qrcode::QrCode;
#[cfg(feature = "ssr")]
use reel_vote::{
    config::Config, create_token, establish_connection, generate_token_code, model::VoterType,
};

// Usage: issue_tokens <audience|judge> [--category NAME] NAME...
#[cfg(feature = "ssr")]
fn main() {
    let mut args = std::env::args().skip(1);
    let token_type: VoterType = args
        .next()
        .expect("Usage: issue_tokens <audience|judge> [--category NAME] NAME...")
        .parse()
        .expect("Token type must be 'audience' or 'judge'");

    let mut category = None;
    let mut names = Vec::new();
    while let Some(arg) = args.next() {
        if arg == "--category" {
            category = Some(args.next().expect("--category needs a value"));
        } else {
            names.push(arg);
        }
    }
    if names.is_empty() {
        eprintln!("Usage: issue_tokens <audience|judge> [--category NAME] NAME...");
        std::process::exit(2);
    }

    let config = Config::load().expect("Invalid configuration");
    let mut conn = establish_connection(&config).expect("Failed to open database");
    let mut rng = rand::rng();

    for name in &names {
        let code = generate_token_code(&mut rng);
        let token = create_token(&mut conn, &code, token_type, name, category.as_deref())
            .expect("Failed to create token");
        let qr = QrCode::new(token.token.as_bytes()).expect("Failed to encode QR code");
        let image = qr
            .render::<char>()
            .quiet_zone(false)
            .module_dimensions(2, 1)
            .build();
        println!("{} ({}): {}", token.person_name, token.token_type, token.token);
        println!("{image}\n");
    }
}

#[cfg(not(feature = "ssr"))]
fn main() {
    println!("This binary requires the 'ssr' feature to be enabled.");
}
