use std::path::Path;

use anyhow::Result;
use serde_json::{json, Value};
use veribuild_chain::fetch::AccountMetadata;
use veribuild_chain::pubkey::Pubkey;
use veribuild_harness::verify::{hash_file, HashedAccount, VerifyError};
use veribuild_kernel::proof::hash::DigestAlgorithm;

use super::{emit_json, Outcome};
use crate::engine::Context;

pub fn executable(
    ctx: &Context,
    path: &Path,
    length: Option<usize>,
    algorithm: DigestAlgorithm,
) -> Result<Outcome> {
    let hash = hash_file(path, length, algorithm)?;
    if ctx.json {
        emit_json(&json!({ "path": path, "executable_hash": hash }))?;
    } else {
        println!("{hash}");
    }
    Ok(Outcome::Done)
}

/// One id prints a bare hash. Several ids print `<id> <hash>` per line in
/// input order; a failed id is logged and the command fails after the rest
/// are printed.
pub fn program(
    ctx: &Context,
    program_ids: &[Pubkey],
    length: Option<usize>,
    algorithm: DigestAlgorithm,
) -> Result<Outcome> {
    if let [program_id] = program_ids {
        let hashed = ctx.engine.program_hash(program_id, length, algorithm)?;
        return print_single(ctx, program_id, &hashed);
    }

    let results: Vec<Result<HashedAccount, VerifyError>> = match length {
        None => ctx.engine.program_hashes(program_ids, algorithm),
        Some(_) => program_ids
            .iter()
            .map(|id| ctx.engine.program_hash(id, length, algorithm))
            .collect(),
    };

    let mut first_error = None;
    let mut rows = Vec::new();
    for (program_id, result) in program_ids.iter().zip(results) {
        match result {
            Ok(hashed) => {
                if ctx.json {
                    rows.push(account_json(program_id, &hashed));
                } else {
                    println!("{program_id} {}", hashed.hash);
                }
            }
            Err(e) => {
                tracing::error!(%program_id, kind = e.kind(), "{e}");
                if ctx.json {
                    rows.push(json!({ "address": program_id, "error": e.to_string() }));
                }
                first_error.get_or_insert(e);
            }
        }
    }
    if ctx.json {
        emit_json(&Value::Array(rows))?;
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(Outcome::Done),
    }
}

pub fn buffer(ctx: &Context, buffer: &Pubkey, algorithm: DigestAlgorithm) -> Result<Outcome> {
    let hashed = ctx.engine.buffer_hash(buffer, algorithm)?;
    print_single(ctx, buffer, &hashed)
}

fn print_single(ctx: &Context, address: &Pubkey, hashed: &HashedAccount) -> Result<Outcome> {
    if ctx.json {
        emit_json(&account_json(address, hashed))?;
    } else {
        println!("{}", hashed.hash);
    }
    Ok(Outcome::Done)
}

fn account_json(address: &Pubkey, hashed: &HashedAccount) -> Value {
    let mut value = json!({
        "address": address,
        "owner": hashed.account.owner(),
        "executable_len": hashed.account.executable_bytes().len(),
        "executable_hash": hashed.hash,
    });
    match hashed.account.metadata() {
        AccountMetadata::NonUpgradeable => {}
        AccountMetadata::ProgramData {
            program_data_address,
            slot,
            upgrade_authority,
        } => {
            value["program_data_address"] = json!(program_data_address);
            value["slot"] = json!(slot);
            value["upgrade_authority"] = json!(upgrade_authority);
        }
        AccountMetadata::Buffer { authority } => {
            value["authority"] = json!(authority);
        }
    }
    value
}
