//! User key generation for user-auth communities.
//!
//! Derives an X25519 keypair from `username:password`. The public half
//! goes into the community's key file referenced by the supernode's ACL;
//! the secret half stays with the edge.
//!
//! Usage:
//!   vesper-keygen --username alice --password hunter2

use clap::Parser;
use vesper::crypto::{derive_user_secret, user_public_key};

#[derive(Parser)]
#[command(name = "vesper-keygen", version, about = "Vesper user key generator")]
struct Args {
    /// Username as it will appear in the community key file
    #[arg(short, long)]
    username: String,

    /// Password the edge derives its secret from
    #[arg(short, long)]
    password: String,
}

fn main() {
    let args = Args::parse();

    let secret = derive_user_secret(&args.username, &args.password);
    let public = user_public_key(&secret);

    println!("# add this line to the community key file on the supernode:");
    println!("{} {}", args.username, hex::encode(public));
    println!();
    println!("# edge secret key (keep private):");
    println!("{}", hex::encode(secret));
}
