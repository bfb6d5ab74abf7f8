use tracing::info;

use crate::api::IdentityApi;
use crate::constants::AGENT_VERSION;
use crate::error::Result;
use crate::pow::{runtime_identity_from_label, spawn_solve_pow, PowSolution};
use crate::types::{ChallengeResponse, VerifyRequest};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredAgent {
    pub agent_id: String,
    pub token: String,
    pub payout_address: String,
    pub label: String,
}

/// Exchanges a solved proof-of-work challenge for an API key.
///
/// A fresh challenge is requested on every call; a half-solved challenge is
/// never reused.
pub struct IdentityBootstrapper<'a, A: IdentityApi + ?Sized> {
    api: &'a A,
    max_iters: u64,
}

impl<'a, A: IdentityApi + ?Sized> IdentityBootstrapper<'a, A> {
    pub fn new(api: &'a A, max_iters: u64) -> Self {
        Self { api, max_iters }
    }

    pub async fn register(&self, payout_address: &str, label: &str) -> Result<RegisteredAgent> {
        let challenge = self.api.request_challenge().await?;
        let solved = spawn_solve_pow(challenge.nonce.clone(), challenge.difficulty, self.max_iters)
            .await??;
        self.submit(challenge, solved, payout_address, label).await
    }

    /// Exchanges a solution to `challenge` for an API key.
    pub async fn submit(
        &self,
        challenge: ChallengeResponse,
        solved: PowSolution,
        payout_address: &str,
        label: &str,
    ) -> Result<RegisteredAgent> {
        info!(
            label,
            difficulty = challenge.difficulty,
            attempts = solved.attempts,
            "pow_solved"
        );

        let verified = self
            .api
            .verify(&VerifyRequest {
                challenge_id: challenge.challenge_id,
                solution: solved.solution,
                payout_address: payout_address.to_string(),
                runtime_identity: runtime_identity_from_label(label),
                name: format!("E2E {label}"),
                version: AGENT_VERSION.to_string(),
            })
            .await?;

        Ok(RegisteredAgent {
            agent_id: verified.agent_id,
            token: verified.api_key,
            payout_address: payout_address.to_string(),
            label: label.to_string(),
        })
    }
}
