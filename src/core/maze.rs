use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::sensor::Sensor;
use crate::vector::{Direction, Vector};

/// Carving moves two cells at a time so walls stay one cell thick.
const CARVE_STEPS: [(i32, i32); 4] = [(0, -2), (2, 0), (0, 2), (-2, 0)];

/// Grid of walls and passages. Entrance is `(0,0)`, exit is `(width-1, height-1)`.
#[derive(Debug, Clone)]
pub struct Maze {
    width: usize,
    height: usize,
    walls: Vec<bool>,
    visited: Vec<bool>,
}

// One pending level of the depth-first carve.
struct CarveFrame {
    x: i32,
    y: i32,
    steps: [(i32, i32); 4],
    next: usize,
}

impl CarveFrame {
    fn enter<R: Rng + ?Sized>(x: i32, y: i32, rng: &mut R) -> Self {
        let mut steps = CARVE_STEPS;
        steps.shuffle(rng);
        Self {
            x,
            y,
            steps,
            next: 0,
        }
    }
}

impl Maze {
    /// A fully walled grid. Dimensions below 2 are raised to 2 so the
    /// entrance and exit cells always exist.
    pub fn new(width: usize, height: usize) -> Self {
        let width = width.max(2);
        let height = height.max(2);
        let cells = width * height;
        Self {
            width,
            height,
            walls: vec![true; cells],
            visited: vec![false; cells],
        }
    }

    /// Build and carve a maze. `None` seeds from OS entropy.
    pub fn generated(width: usize, height: usize, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut maze = Self::new(width, height);
        maze.generate(&mut rng);
        maze
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn exit(&self) -> Vector {
        Vector::new(self.width as i32 - 1, self.height as i32 - 1)
    }

    /// Refill with walls and carve with a randomized depth-first backtracker
    /// rooted at `(1,1)`, then force the entrance and exit pairs open.
    ///
    /// The carve is an explicit stack, but visits neighbours in exactly the
    /// order the recursive formulation would: each cell shuffles its four
    /// two-step neighbours on entry and walks them in that order, descending
    /// into any that is still walled.
    pub fn generate<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.walls.iter_mut().for_each(|w| *w = true);
        self.visited.iter_mut().for_each(|v| *v = false);

        self.open(1, 1);
        let mut stack = vec![CarveFrame::enter(1, 1, rng)];

        while let Some(frame) = stack.last_mut() {
            if frame.next == frame.steps.len() {
                stack.pop();
                continue;
            }
            let (dx, dy) = frame.steps[frame.next];
            frame.next += 1;

            let (x, y) = (frame.x, frame.y);
            let (nx, ny) = (x + dx, y + dy);
            if self.in_bounds(nx, ny) && self.is_wall(nx, ny) {
                self.open(x + dx / 2, y + dy / 2);
                self.open(nx, ny);
                stack.push(CarveFrame::enter(nx, ny, rng));
            }
        }

        // Applied after carving, unconditionally.
        let (w, h) = (self.width as i32, self.height as i32);
        self.open(0, 0);
        self.open(1, 0);
        self.open(w - 1, h - 1);
        self.open(w - 2, h - 1);
    }

    pub fn is_available(&self, pos: Vector) -> bool {
        self.in_bounds(pos.x, pos.y) && !self.is_wall(pos.x, pos.y)
    }

    /// Out-of-bounds neighbours read as blocked.
    pub fn sensor_at(&self, pos: Vector) -> Sensor {
        Sensor {
            left: !self.is_available(pos.step(Direction::Left)),
            right: !self.is_available(pos.step(Direction::Right)),
            up: !self.is_available(pos.step(Direction::Up)),
            down: !self.is_available(pos.step(Direction::Down)),
        }
    }

    pub fn is_solved(&self, pos: Vector) -> bool {
        pos == self.exit()
    }

    /// Mark a cell as visited for diagnostic rendering. Ignored out of bounds.
    pub fn visit(&mut self, pos: Vector) {
        if let Some(i) = self.idx(pos.x, pos.y) {
            self.visited[i] = true;
        }
    }

    pub fn is_visited(&self, pos: Vector) -> bool {
        self.idx(pos.x, pos.y).is_some_and(|i| self.visited[i])
    }

    fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height
    }

    fn idx(&self, x: i32, y: i32) -> Option<usize> {
        self.in_bounds(x, y)
            .then(|| (y as usize) * self.width + (x as usize))
    }

    fn is_wall(&self, x: i32, y: i32) -> bool {
        self.idx(x, y).map_or(true, |i| self.walls[i])
    }

    fn open(&mut self, x: i32, y: i32) {
        if let Some(i) = self.idx(x, y) {
            self.walls[i] = false;
        }
    }
}
