//! Persisted per-module artifacts for separate compilation.
//!
//! A compiled module's interface and primitive-form implementations are
//! stable-serialised with bincode, behind a format version guard. Decoding
//! an artifact yields a module structurally equal to the one encoded.

use crate::diag::CompileError;
use crate::modules::Module;
use serde::{Deserialize, Serialize};

/// Bumped whenever the serialised shape of [`Module`] changes.
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Artifact {
    version: u32,
    module: Module,
}

/// Encodes a compiled module.
pub fn encode_module(module: &Module) -> Result<Vec<u8>, CompileError> {
    bincode::serialize(&Artifact {
        version: FORMAT_VERSION,
        module: module.clone(),
    })
    .map_err(|err| CompileError::Artifact(format!("encoding failed: {err}")))
}

/// Decodes a previously encoded module, rejecting other format versions.
pub fn decode_module(bytes: &[u8]) -> Result<Module, CompileError> {
    let artifact: Artifact = bincode::deserialize(bytes)
        .map_err(|err| CompileError::Artifact(format!("decoding failed: {err}")))?;
    if artifact.version != FORMAT_VERSION {
        return Err(CompileError::Artifact(format!(
            "artifact format {} but this compiler reads {FORMAT_VERSION}",
            artifact.version
        )));
    }
    Ok(artifact.module)
}
