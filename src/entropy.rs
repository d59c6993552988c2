//! Entropy sources for the winning draw.
//!
//! The engine never generates randomness itself; it asks an [`EntropySource`]
//! for a value already inside the round's guess range. [`VrfEntropy`] commits
//! to the closed guess log so the draw can be re-verified by anyone holding
//! the public key.

use crate::types::EntropyProof;
use schnorrkel::{
    context::SigningContext,
    vrf::{VRFPreOut, VRFProof},
    Keypair, PublicKey,
};
use std::sync::Arc;

const VRF_SIGNING_CONTEXT: &[u8] = b"lottery-draw";
const VRF_VALUE_CONTEXT: &[u8] = b"winning-value";

/// What the source is asked to draw for
#[derive(Debug, Clone)]
pub struct DrawRequest {
    pub round_id: u64,
    pub min: u8,
    pub max: u8,
    /// Digest of the closed guess log
    pub guess_log_digest: String,
}

impl DrawRequest {
    pub fn input_message(&self) -> String {
        format!(
            "round:{}:range:{}-{}:guesses:{}",
            self.round_id, self.min, self.max, self.guess_log_digest
        )
    }
}

#[derive(Debug, Clone)]
pub struct Draw {
    pub value: u8,
    pub proof: EntropyProof,
}

#[derive(Debug, thiserror::Error)]
pub enum EntropyError {
    #[error("Entropy unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed proof: {0}")]
    MalformedProof(String),
}

/// External provider of the winning value
pub trait EntropySource: Send + Sync {
    fn draw(&self, request: &DrawRequest) -> Result<Draw, EntropyError>;
}

/// Always yields the same value; for tests and externally decided draws
#[derive(Debug, Clone)]
pub struct FixedEntropy {
    value: u8,
}

impl FixedEntropy {
    pub fn new(value: u8) -> Self {
        Self { value }
    }
}

impl EntropySource for FixedEntropy {
    fn draw(&self, request: &DrawRequest) -> Result<Draw, EntropyError> {
        Ok(Draw {
            value: self.value,
            proof: EntropyProof {
                source: "fixed".to_string(),
                input_message: request.input_message(),
                output: hex::encode([self.value]),
                proof: String::new(),
                public_key: String::new(),
            },
        })
    }
}

/// VRF-backed draw using a schnorrkel keypair.
///
/// The VRF output is unique per (key, input), so the key holder cannot
/// re-roll a draw for the same closed guess log.
pub struct VrfEntropy {
    keypair: Arc<Keypair>,
}

impl VrfEntropy {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair: Arc::new(keypair),
        }
    }

    /// Random keypair; the draw is verifiable but not reproducible across restarts
    pub fn new_random() -> Self {
        use rand_core::OsRng;
        Self::new(Keypair::generate_with(OsRng))
    }

    /// Restore from a 64-byte secret key (hex), e.g. loaded from an operator's key file
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, EntropyError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| EntropyError::MalformedProof(format!("Invalid secret key hex: {}", e)))?;
        let secret = schnorrkel::SecretKey::from_bytes(&bytes)
            .map_err(|e| EntropyError::MalformedProof(format!("Invalid secret key: {:?}", e)))?;
        Ok(Self::new(secret.to_keypair()))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public.to_bytes())
    }

    /// Re-check a recorded draw against the message it claims to commit to.
    ///
    /// Returns the value the proof yields in `min..=max`, or `None` when the
    /// proof does not verify for `expected_input`.
    pub fn verify(
        proof: &EntropyProof,
        expected_input: &str,
        min: u8,
        max: u8,
    ) -> Result<Option<u8>, EntropyError> {
        if proof.input_message != expected_input {
            return Ok(None);
        }

        let preout_bytes = hex::decode(&proof.output)
            .map_err(|e| EntropyError::MalformedProof(format!("Invalid output hex: {}", e)))?;
        let proof_bytes = hex::decode(&proof.proof)
            .map_err(|e| EntropyError::MalformedProof(format!("Invalid proof hex: {}", e)))?;
        let key_bytes = hex::decode(&proof.public_key)
            .map_err(|e| EntropyError::MalformedProof(format!("Invalid public key hex: {}", e)))?;

        let public_key = PublicKey::from_bytes(&key_bytes)
            .map_err(|e| EntropyError::MalformedProof(format!("Invalid public key: {:?}", e)))?;
        let preout = VRFPreOut::from_bytes(&preout_bytes)
            .map_err(|e| EntropyError::MalformedProof(format!("Invalid VRF output: {:?}", e)))?;
        let vrf_proof = VRFProof::from_bytes(&proof_bytes)
            .map_err(|e| EntropyError::MalformedProof(format!("Invalid VRF proof: {:?}", e)))?;

        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        match public_key.vrf_verify(ctx.bytes(expected_input.as_bytes()), &preout, &vrf_proof) {
            Ok((io, _)) => {
                let bytes: [u8; 8] = io.make_bytes(VRF_VALUE_CONTEXT);
                Ok(Some(value_in_range(&bytes, min, max)))
            }
            Err(_) => Ok(None),
        }
    }
}

/// Map raw output bytes uniformly-enough onto `min..=max`
pub fn value_in_range(output: &[u8], min: u8, max: u8) -> u8 {
    let span = u64::from(max - min) + 1;
    let mut word = [0u8; 8];
    let n = output.len().min(8);
    word[..n].copy_from_slice(&output[..n]);
    min + (u64::from_be_bytes(word) % span) as u8
}

impl EntropySource for VrfEntropy {
    fn draw(&self, request: &DrawRequest) -> Result<Draw, EntropyError> {
        if request.min > request.max {
            return Err(EntropyError::Unavailable(format!(
                "empty range {}..={}",
                request.min, request.max
            )));
        }
        let input_message = request.input_message();
        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        let (io, proof, _) = self.keypair.vrf_sign(ctx.bytes(input_message.as_bytes()));
        let bytes: [u8; 8] = io.make_bytes(VRF_VALUE_CONTEXT);

        Ok(Draw {
            value: value_in_range(&bytes, request.min, request.max),
            proof: EntropyProof {
                source: "vrf".to_string(),
                input_message,
                output: hex::encode(io.to_preout().to_bytes()),
                proof: hex::encode(proof.to_bytes()),
                public_key: self.public_key_hex(),
            },
        })
    }
}
