use crate::types::{Direction, GridSize, Position};

pub(super) fn manhattan(a: Position, b: Position) -> i32 {
    (a.x - b.x).abs() + (a.y - b.y).abs()
}

pub(super) fn offset(pos: Position, dir: Direction) -> Position {
    match dir {
        Direction::Up => Position::new(pos.x, pos.y - 1),
        Direction::Down => Position::new(pos.x, pos.y + 1),
        Direction::Left => Position::new(pos.x - 1, pos.y),
        Direction::Right => Position::new(pos.x + 1, pos.y),
    }
}

/// Cell reached by one step, clamped to the grid like the server clamps moves.
pub(super) fn next_cell(pos: Position, dir: Direction, grid: GridSize) -> Position {
    let moved = offset(pos, dir);
    Position::new(
        moved.x.clamp(0, (grid.width - 1).max(0)),
        moved.y.clamp(0, (grid.height - 1).max(0)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manhattan_sums_axis_distances() {
        assert_eq!(manhattan(Position::new(0, 0), Position::new(5, 5)), 10);
        assert_eq!(manhattan(Position::new(9, 9), Position::new(5, 5)), 8);
        assert_eq!(manhattan(Position::new(2, 3), Position::new(2, 3)), 0);
    }

    #[test]
    fn next_cell_is_clamped_at_grid_edges() {
        let grid = GridSize {
            width: 4,
            height: 3,
        };
        let corner = Position::new(0, 0);
        assert_eq!(next_cell(corner, Direction::Left, grid), corner);
        assert_eq!(next_cell(corner, Direction::Up, grid), corner);
        assert_eq!(
            next_cell(corner, Direction::Right, grid),
            Position::new(1, 0)
        );
        let far = Position::new(3, 2);
        assert_eq!(next_cell(far, Direction::Right, grid), far);
        assert_eq!(next_cell(far, Direction::Down, grid), far);
    }
}
