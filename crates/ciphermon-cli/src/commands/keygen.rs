//! `ciphermon keygen` command implementation

use anyhow::Result;
use ciphermon_core::DecryptionProofSigner;
use serde::Serialize;

use super::check_format;

#[derive(Serialize)]
struct KeyPairOutput {
    signing_seed_hex: String,
    proof_public_key_hex: String,
}

pub fn run(format: String) -> Result<()> {
    check_format(&format)?;
    let signer = DecryptionProofSigner::generate();
    let out = KeyPairOutput {
        signing_seed_hex: signer.seed_hex(),
        proof_public_key_hex: hex::encode(signer.verifier().to_bytes()),
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Decryption proof key pair");
    println!();
    println!("   Public key (crypto.proof_public_key_hex):");
    println!("   {}", out.proof_public_key_hex);
    println!();
    println!("   Signing seed (keep secret; give only to the decryption service):");
    println!("   {}", out.signing_seed_hex);
    Ok(())
}
