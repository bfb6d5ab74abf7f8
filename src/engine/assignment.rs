use std::collections::{HashMap, HashSet};

use super::utils::manhattan;
use crate::types::{AgentId, Coin, CoinId, Position};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub coin_id: CoinId,
    pub position: Position,
}

/// Greedy nearest-pair matching of agents to coins.
///
/// Pairs are ordered by Manhattan distance with ties kept in input order
/// (agents first, then coins). With `partial == false` nothing is assigned
/// unless every agent can get a coin.
pub fn assign_targets(
    agents: &[(AgentId, Position)],
    coins: &[Coin],
    partial: bool,
) -> HashMap<AgentId, Assignment> {
    let mut assignments = HashMap::new();
    if agents.is_empty() || coins.is_empty() {
        return assignments;
    }
    if !partial && coins.len() < agents.len() {
        return assignments;
    }

    let mut pairs = Vec::with_capacity(agents.len() * coins.len());
    for (agent_idx, (_, agent_pos)) in agents.iter().enumerate() {
        for (coin_idx, coin) in coins.iter().enumerate() {
            pairs.push((manhattan(*agent_pos, coin.position), agent_idx, coin_idx));
        }
    }
    // Stable: equal distances keep (agent, coin) input order.
    pairs.sort_by_key(|(dist, _, _)| *dist);

    let mut claimed_agents: HashSet<&str> = HashSet::new();
    let mut claimed_coins: HashSet<CoinId> = HashSet::new();
    for (_, agent_idx, coin_idx) in pairs {
        if claimed_coins.len() == coins.len() || claimed_agents.len() == agents.len() {
            break;
        }
        let agent_id = agents[agent_idx].0.as_str();
        let coin = coins[coin_idx];
        if claimed_agents.contains(agent_id) || claimed_coins.contains(&coin.id) {
            continue;
        }
        claimed_agents.insert(agent_id);
        claimed_coins.insert(coin.id);
        assignments.insert(
            agent_id.to_string(),
            Assignment {
                coin_id: coin.id,
                position: coin.position,
            },
        );
    }
    assignments
}
