use std::collections::HashSet;

use super::assignment::Assignment;
use super::utils::{manhattan, next_cell};
use crate::rng::Rng;
use crate::types::{Coin, CoinId, Direction, GridSize, Position, Slot};

/// All four directions, best first: the dominant axis, the other axis, then
/// the remaining ones in `Direction::ALL` order. Ties favour the horizontal axis.
pub fn rank_directions(from: Position, to: Position) -> [Direction; 4] {
    let dx = to.x - from.x;
    let dy = to.y - from.y;
    let horizontal = match dx.signum() {
        1 => Some(Direction::Right),
        -1 => Some(Direction::Left),
        _ => None,
    };
    let vertical = match dy.signum() {
        1 => Some(Direction::Down),
        -1 => Some(Direction::Up),
        _ => None,
    };
    let preferred = if dx.abs() >= dy.abs() {
        [horizontal, vertical]
    } else {
        [vertical, horizontal]
    };

    let mut ranked = Direction::ALL;
    let mut filled = 0;
    for dir in preferred.into_iter().flatten().chain(Direction::ALL) {
        if !ranked[..filled].contains(&dir) {
            ranked[filled] = dir;
            filled += 1;
        }
    }
    ranked
}

/// First ranked direction whose clamped destination is free. When every
/// neighbour is taken the top-ranked direction is returned anyway.
pub fn choose_direction(
    from: Position,
    to: Position,
    grid: GridSize,
    occupied: &HashSet<Position>,
    prefer_shuffle: bool,
    rng: &mut Rng,
) -> Direction {
    let mut ranked = rank_directions(from, to);
    if prefer_shuffle {
        rng.shuffle(&mut ranked[1..]);
    }
    ranked
        .into_iter()
        .find(|dir| !occupied.contains(&next_cell(from, *dir, grid)))
        .unwrap_or(ranked[0])
}

/// Inclusive x-range of the horizontal slice patrolled by `slot`.
pub fn slice_bounds(slot: Slot, slices: u32, width: i32) -> (i32, i32) {
    let slices = slices.max(1) as i64;
    let slot = (slot as i64) % slices;
    let width = width.max(1) as i64;
    let start = slot * width / slices;
    let end = ((slot + 1) * width / slices - 1).max(start);
    (start as i32, end as i32)
}

/// Serpentine sweep state: horizontal and vertical step signs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Patrol {
    pub horizontal: i32,
    pub vertical: i32,
}

impl Patrol {
    pub fn for_slot(slot: Slot) -> Self {
        Self {
            horizontal: if slot % 2 == 0 { 1 } else { -1 },
            vertical: 1,
        }
    }

    /// Next cell to aim for while sweeping `[start, end]`. Hitting a slice edge
    /// flips the horizontal step and moves one row; hitting a grid edge flips
    /// the vertical step.
    pub fn waypoint(&mut self, pos: Position, bounds: (i32, i32), grid: GridSize) -> Position {
        let (start, end) = bounds;
        if pos.x < start {
            return Position::new(start, pos.y);
        }
        if pos.x > end {
            return Position::new(end, pos.y);
        }

        let next_x = pos.x + self.horizontal;
        if next_x >= start && next_x <= end {
            return Position::new(next_x, pos.y);
        }

        self.horizontal = -self.horizontal;
        let in_rows = |y: i32| y >= 0 && y < grid.height;
        let mut next_y = pos.y + self.vertical;
        if !in_rows(next_y) {
            self.vertical = -self.vertical;
            next_y = pos.y + self.vertical;
            if !in_rows(next_y) {
                next_y = pos.y;
            }
        }
        Position::new(pos.x, next_y)
    }
}

/// Snapshot-derived inputs shared by every agent of a lobby in one cycle.
pub struct MoveContext<'a> {
    pub grid: GridSize,
    pub coins: &'a [Coin],
    pub occupied: &'a HashSet<Position>,
    /// Coins handed out by this cycle's assignment.
    pub claimed: &'a HashSet<CoinId>,
    pub slices: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SentInput {
    tick: u64,
    position: Position,
}

/// Per-agent movement memory carried across cycles.
#[derive(Clone, Debug, Default)]
pub struct AgentMotion {
    target: Option<CoinId>,
    patrol: Option<Patrol>,
    blocked_count: u32,
    last_sent: Option<SentInput>,
}

impl AgentMotion {
    pub fn target(&self) -> Option<CoinId> {
        self.target
    }

    pub fn blocked_count(&self) -> u32 {
        self.blocked_count
    }

    pub fn last_sent_tick(&self) -> Option<u64> {
        self.last_sent.map(|sent| sent.tick)
    }

    /// Whether `every` ticks have passed since the last delivered input.
    pub fn is_due(&self, tick: u64, every: u64) -> bool {
        match self.last_sent {
            Some(sent) => tick.saturating_sub(sent.tick) >= every,
            None => true,
        }
    }

    /// Updates the stuck counter. Blocked means the agent still stands where
    /// it stood when the last input was delivered and the tick moved on.
    pub fn observe(&mut self, tick: u64, position: Position) -> bool {
        let blocked = self
            .last_sent
            .is_some_and(|sent| sent.position == position && tick > sent.tick);
        if blocked {
            self.blocked_count += 1;
        } else {
            self.blocked_count = 0;
        }
        blocked
    }

    pub fn record_sent(&mut self, tick: u64, position: Position) {
        self.last_sent = Some(SentInput { tick, position });
    }

    /// Picks this cycle's direction: fresh assignment, then the remembered
    /// coin, then the nearest unclaimed coin, then the slice sweep.
    pub fn plan(
        &mut self,
        position: Position,
        slot: Slot,
        assignment: Option<&Assignment>,
        ctx: &MoveContext<'_>,
        prefer_shuffle: bool,
        rng: &mut Rng,
    ) -> Direction {
        let goal = match self.resolve_target(position, assignment, ctx) {
            Some(goal) => goal,
            None => {
                let bounds = slice_bounds(slot, ctx.slices, ctx.grid.width);
                self.patrol
                    .get_or_insert_with(|| Patrol::for_slot(slot))
                    .waypoint(position, bounds, ctx.grid)
            }
        };
        choose_direction(position, goal, ctx.grid, ctx.occupied, prefer_shuffle, rng)
    }

    fn resolve_target(
        &mut self,
        position: Position,
        assignment: Option<&Assignment>,
        ctx: &MoveContext<'_>,
    ) -> Option<Position> {
        if let Some(assigned) = assignment {
            self.target = Some(assigned.coin_id);
            return Some(assigned.position);
        }
        if let Some(remembered) = self
            .target
            .and_then(|id| ctx.coins.iter().find(|coin| coin.id == id))
        {
            return Some(remembered.position);
        }
        let nearest = ctx
            .coins
            .iter()
            .filter(|coin| !ctx.claimed.contains(&coin.id))
            .min_by_key(|coin| manhattan(position, coin.position));
        self.target = nearest.map(|coin| coin.id);
        nearest.map(|coin| coin.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::assignment::assign_targets;

    const GRID: GridSize = GridSize {
        width: 10,
        height: 10,
    };

    fn coin(id: CoinId, x: i32, y: i32) -> Coin {
        Coin {
            id,
            position: Position::new(x, y),
        }
    }

    #[test]
    fn ranking_leads_with_the_dominant_axis() {
        let origin = Position::new(5, 5);
        assert_eq!(
            rank_directions(origin, Position::new(9, 6)),
            [
                Direction::Right,
                Direction::Down,
                Direction::Up,
                Direction::Left
            ]
        );
        assert_eq!(
            rank_directions(origin, Position::new(4, 1)),
            [
                Direction::Up,
                Direction::Left,
                Direction::Down,
                Direction::Right
            ]
        );
        assert_eq!(rank_directions(origin, Position::new(7, 3))[0], Direction::Right);
        assert_eq!(rank_directions(origin, origin), Direction::ALL);
    }

    #[test]
    fn unshuffled_choice_is_deterministic_with_free_neighbours() {
        let occupied = HashSet::new();
        let from = Position::new(2, 2);
        let to = Position::new(2, 8);
        for seed in 1..20 {
            let mut rng = Rng::new(seed);
            assert_eq!(
                choose_direction(from, to, GRID, &occupied, false, &mut rng),
                Direction::Down
            );
        }
    }

    #[test]
    fn choice_skips_occupied_cells() {
        let from = Position::new(2, 2);
        let occupied: HashSet<Position> = [Position::new(3, 2), from].into_iter().collect();
        let mut rng = Rng::new(1);
        assert_eq!(
            choose_direction(from, Position::new(8, 4), GRID, &occupied, false, &mut rng),
            Direction::Down
        );
    }

    #[test]
    fn edge_clamping_counts_as_staying_in_place() {
        let from = Position::new(0, 0);
        let occupied: HashSet<Position> = [from, Position::new(1, 0)].into_iter().collect();
        let mut rng = Rng::new(1);
        // Left and up clamp back onto the agent's own cell.
        assert_eq!(
            choose_direction(from, Position::new(5, 0), GRID, &occupied, false, &mut rng),
            Direction::Down
        );
    }

    #[test]
    fn fully_surrounded_agent_keeps_the_top_direction() {
        let from = Position::new(5, 5);
        let occupied: HashSet<Position> = [
            Position::new(5, 4),
            Position::new(5, 6),
            Position::new(4, 5),
            Position::new(6, 5),
        ]
        .into_iter()
        .collect();
        let mut rng = Rng::new(3);
        assert_eq!(
            choose_direction(from, Position::new(0, 5), GRID, &occupied, true, &mut rng),
            Direction::Left
        );
    }

    #[test]
    fn shuffle_keeps_the_top_direction_when_it_is_free() {
        let occupied = HashSet::new();
        for seed in 1..100 {
            let mut rng = Rng::new(seed);
            assert_eq!(
                choose_direction(
                    Position::new(5, 5),
                    Position::new(9, 5),
                    GRID,
                    &occupied,
                    true,
                    &mut rng
                ),
                Direction::Right
            );
        }
    }

    #[test]
    fn shuffle_varies_the_fallback_when_the_top_is_blocked() {
        let from = Position::new(5, 5);
        let occupied: HashSet<Position> = [Position::new(6, 5)].into_iter().collect();
        let mut seen = HashSet::new();
        for seed in 1..200 {
            let mut rng = Rng::new(seed);
            let dir = choose_direction(from, Position::new(9, 6), GRID, &occupied, true, &mut rng);
            assert_ne!(dir, Direction::Right);
            seen.insert(dir);
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn stuck_counter_increments_while_parked_and_resets_on_movement() {
        let mut motion = AgentMotion::default();
        let here = Position::new(1, 1);
        assert!(!motion.observe(0, here));
        motion.record_sent(0, here);

        assert!(motion.observe(1, here));
        assert_eq!(motion.blocked_count(), 1);
        motion.record_sent(1, here);
        assert!(motion.observe(2, here));
        assert_eq!(motion.blocked_count(), 2);

        motion.record_sent(2, here);
        assert!(!motion.observe(3, Position::new(2, 1)));
        assert_eq!(motion.blocked_count(), 0);
    }

    #[test]
    fn same_tick_is_not_considered_blocked() {
        let mut motion = AgentMotion::default();
        let here = Position::new(1, 1);
        motion.record_sent(4, here);
        assert!(!motion.observe(4, here));
        assert_eq!(motion.blocked_count(), 0);
    }

    #[test]
    fn throttle_waits_for_the_configured_tick_gap() {
        let mut motion = AgentMotion::default();
        assert!(motion.is_due(0, 3));
        motion.record_sent(10, Position::new(0, 0));
        assert!(!motion.is_due(12, 3));
        assert!(motion.is_due(13, 3));
        assert_eq!(motion.last_sent_tick(), Some(10));
    }

    #[test]
    fn slices_partition_the_grid_width() {
        assert_eq!(slice_bounds(0, 2, 10), (0, 4));
        assert_eq!(slice_bounds(1, 2, 10), (5, 9));
        assert_eq!(slice_bounds(3, 4, 10), (7, 9));
        // More slices than columns still yields a non-empty range.
        assert_eq!(slice_bounds(0, 20, 10), (0, 0));
        assert_eq!(slice_bounds(5, 2, 10), (5, 9));
    }

    #[test]
    fn sweep_reverses_at_the_slice_edge_and_steps_a_row() {
        let mut patrol = Patrol::for_slot(0);
        let bounds = slice_bounds(0, 2, 10);
        assert_eq!(
            patrol.waypoint(Position::new(3, 2), bounds, GRID),
            Position::new(4, 2)
        );
        assert_eq!(
            patrol.waypoint(Position::new(4, 2), bounds, GRID),
            Position::new(4, 3)
        );
        assert_eq!(patrol.horizontal, -1);
        assert_eq!(
            patrol.waypoint(Position::new(4, 3), bounds, GRID),
            Position::new(3, 3)
        );
    }

    #[test]
    fn sweep_flips_vertical_direction_at_the_grid_edge() {
        let mut patrol = Patrol::for_slot(1);
        let bounds = slice_bounds(1, 2, 10);
        assert_eq!(patrol.horizontal, -1);
        assert_eq!(
            patrol.waypoint(Position::new(5, 9), bounds, GRID),
            Position::new(5, 8)
        );
        assert_eq!(patrol.vertical, -1);
        assert_eq!(patrol.horizontal, 1);
    }

    #[test]
    fn sweep_heads_back_into_the_slice() {
        let mut patrol = Patrol::for_slot(1);
        let bounds = slice_bounds(1, 2, 10);
        assert_eq!(
            patrol.waypoint(Position::new(0, 4), bounds, GRID),
            Position::new(5, 4)
        );
    }

    #[test]
    fn remembered_target_is_followed_until_it_disappears() {
        let mut motion = AgentMotion::default();
        let occupied = HashSet::new();
        let claimed = HashSet::new();
        let mut rng = Rng::new(1);
        let coins = [coin(1, 9, 0), coin(2, 0, 2)];
        let assigned = Assignment {
            coin_id: 1,
            position: Position::new(9, 0),
        };
        let ctx = MoveContext {
            grid: GRID,
            coins: &coins,
            occupied: &occupied,
            claimed: &claimed,
            slices: 2,
        };
        let pos = Position::new(0, 0);
        assert_eq!(
            motion.plan(pos, 0, Some(&assigned), &ctx, false, &mut rng),
            Direction::Right
        );
        // No fresh assignment: coin 1 is still chased although coin 2 is closer.
        assert_eq!(
            motion.plan(pos, 0, None, &ctx, false, &mut rng),
            Direction::Right
        );
        assert_eq!(motion.target(), Some(1));

        let remaining = [coin(2, 0, 2)];
        let ctx = MoveContext {
            coins: &remaining,
            ..ctx
        };
        assert_eq!(
            motion.plan(pos, 0, None, &ctx, false, &mut rng),
            Direction::Down
        );
        assert_eq!(motion.target(), Some(2));
    }

    #[test]
    fn agent_without_coins_sweeps_and_forgets_its_target() {
        let mut motion = AgentMotion::default();
        let occupied = HashSet::new();
        let claimed = HashSet::new();
        let mut rng = Rng::new(1);
        let coins = [coin(4, 3, 3)];
        let ctx = MoveContext {
            grid: GRID,
            coins: &coins,
            occupied: &occupied,
            claimed: &claimed,
            slices: 2,
        };
        motion.plan(Position::new(1, 1), 0, None, &ctx, false, &mut rng);
        assert_eq!(motion.target(), Some(4));

        let ctx = MoveContext { coins: &[], ..ctx };
        assert_eq!(
            motion.plan(Position::new(1, 1), 0, None, &ctx, false, &mut rng),
            Direction::Right
        );
        assert_eq!(motion.target(), None);
    }

    #[test]
    fn unassigned_agent_sweeps_when_the_only_coin_is_claimed() {
        let agents = vec![
            ("near-origin".to_string(), Position::new(0, 0)),
            ("near-corner".to_string(), Position::new(9, 9)),
        ];
        let coins = [coin(1, 5, 5)];
        let assignments = assign_targets(&agents, &coins, true);
        let claimed: HashSet<CoinId> = assignments.values().map(|a| a.coin_id).collect();
        let occupied: HashSet<Position> = agents.iter().map(|(_, pos)| *pos).collect();
        let ctx = MoveContext {
            grid: GRID,
            coins: &coins,
            occupied: &occupied,
            claimed: &claimed,
            slices: 2,
        };
        let mut rng = Rng::new(1);

        let mut winner = AgentMotion::default();
        let dir = winner.plan(
            Position::new(9, 9),
            1,
            assignments.get("near-corner"),
            &ctx,
            false,
            &mut rng,
        );
        assert_eq!(dir, Direction::Left);
        assert_eq!(winner.target(), Some(1));

        let mut other = AgentMotion::default();
        let dir = other.plan(
            Position::new(0, 0),
            0,
            assignments.get("near-origin"),
            &ctx,
            false,
            &mut rng,
        );
        assert_eq!(other.target(), None);
        assert_eq!(dir, Direction::Right);
    }
}
