//! Directional mutation: gradient descent away from a forbidden execution.
//!
//! The "gradient" here is deliberately heuristic. Per trace position the
//! embedding distance between the two executions stands in for an output
//! delta, and dividing by the raw byte difference of the two inputs stands in
//! for a sensitivity. Chaining the two through `dL/dx = J^T * dL/dy` yields a
//! per-byte descent direction away from the forbidden path. Invalid inputs
//! are programmer errors; this module asserts its contracts instead of
//! returning them.

use crate::{embedding_loss, BlockTrace, FuzzExecution, FuzzInput, TraceGraph};

/// Default per-byte learning rate for fresh exploration-speed components.
pub const DEFAULT_ETA: f64 = 0.01;

/// Value assigned to a byte that just participated in a trace discovery.
pub const FREEZE_ETA: f64 = -1.0;

/// Per-iteration thaw increment for frozen components. Positive components
/// grow at a tenth of this rate.
pub const THAW_ACCELERATION: f64 = 0.001;

const ETA_CAP: f64 = 1.0;

/// Per-byte exploration speed, parallel to the worker's current input.
/// A component `<= 0` freezes its byte; a positive component is the byte's
/// learning rate.
#[derive(Debug, Clone, Default)]
pub struct ExplorationSpeed {
    etas: Vec<f64>,
}

impl ExplorationSpeed {
    pub fn new(len: usize) -> Self {
        Self {
            etas: vec![DEFAULT_ETA; len],
        }
    }

    pub fn len(&self) -> usize {
        self.etas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.etas.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.etas
    }

    /// Fit the vector to a new input size. Existing components keep their
    /// state; new bytes start at the default rate.
    pub fn resize_for(&mut self, len: usize) {
        self.etas.resize(len, DEFAULT_ETA);
    }

    /// Freeze every byte position whose value differs between the previous
    /// input and the input that just produced a new trace.
    pub fn freeze_changed(&mut self, previous: &[u8], accepted: &[u8]) {
        let len = previous.len().max(accepted.len());
        if self.etas.len() < len {
            self.etas.resize(len, DEFAULT_ETA);
        }
        for i in 0..len {
            let old = previous.get(i).copied().unwrap_or(0);
            let new = accepted.get(i).copied().unwrap_or(0);
            if old != new {
                self.etas[i] = FREEZE_ETA;
            }
        }
    }

    /// Move every component toward mutability: frozen components gain the
    /// full acceleration and snap to the cap the moment they cross zero;
    /// positive ones grow at a tenth of the rate, capped at +1.0.
    pub fn thaw(&mut self, acceleration: f64) {
        for eta in &mut self.etas {
            if *eta < 0.0 {
                *eta += acceleration;
                if *eta > 0.0 {
                    *eta = ETA_CAP;
                }
            } else if *eta > 0.0 {
                *eta = (*eta + acceleration * 0.1).min(ETA_CAP);
            }
        }
    }
}

/// Produce the next input by descending `dL/dx` away from `forbidden`,
/// honoring the per-byte exploration speed.
pub fn descend(
    graph: &TraceGraph,
    forbidden: &FuzzExecution,
    current: &FuzzExecution,
    speed: &ExplorationSpeed,
) -> FuzzInput {
    let dl_dy = loss_gradient(graph, &forbidden.trace, &current.trace);
    let jacobian = behavioral_jacobian(graph, forbidden, current);

    assert!(!jacobian.is_empty(), "descend: jacobian has no rows");
    assert!(!jacobian[0].is_empty(), "descend: jacobian has no columns");
    assert_eq!(
        jacobian.len(),
        dl_dy.len(),
        "descend: jacobian rows must match dL/dy length"
    );
    let width = jacobian[0].len();
    assert!(
        jacobian.iter().all(|row| row.len() == width),
        "descend: jacobian rows have inconsistent widths"
    );
    assert_eq!(
        speed.len(),
        width,
        "descend: exploration speed must match input width"
    );

    // Chain rule: dL/dx = J^T * dL/dy.
    let mut dl_dx = vec![0.0; width];
    for (j, out) in dl_dx.iter_mut().enumerate() {
        let mut sum = 0.0;
        for (i, row) in jacobian.iter().enumerate() {
            sum += row[j] * dl_dy[i];
        }
        *out = sum;
    }

    let mut next = Vec::with_capacity(width);
    for j in 0..width {
        let current_byte = current.input.get(j).copied().unwrap_or(0);
        let eta = speed.as_slice()[j];
        if eta <= 0.0 {
            next.push(current_byte);
            continue;
        }

        next.push(update_byte(current_byte, eta, dl_dx[j]));
    }
    next
}

/// Apply one descent step to a byte. Below zero clamps, above 255 wraps; the
/// asymmetry is intentional.
fn update_byte(current: u8, eta: f64, gradient: f64) -> u8 {
    let mut updated = current as f64 - eta * gradient;
    if updated < 0.0 {
        updated = 0.0;
    } else if updated > 255.0 {
        updated %= 256.0;
    }
    updated.round() as u8
}

/// `dL/dy`: per trace position, the loss scaled by the inverse of the
/// embedding distance between the two executions at that position (the loss
/// itself when the nodes coincide).
fn loss_gradient(graph: &TraceGraph, forbidden: &BlockTrace, current: &BlockTrace) -> Vec<f64> {
    let loss = embedding_loss(graph, forbidden, current);
    trace_distances(graph, forbidden, current)
        .into_iter()
        .map(|d| if d != 0.0 { loss / d } else { loss })
        .collect()
}

/// `dy/dx`: pairwise finite difference between the two executions. Rows are
/// trace positions, columns input bytes; a zero byte delta contributes
/// nothing to its column.
fn behavioral_jacobian(
    graph: &TraceGraph,
    forbidden: &FuzzExecution,
    current: &FuzzExecution,
) -> Vec<Vec<f64>> {
    graph.absorb_trace(&current.trace);
    graph.absorb_trace(&forbidden.trace);
    graph.train_embeddings();

    let dy = trace_distances(graph, &forbidden.trace, &current.trace);

    let width = forbidden.input.len().max(current.input.len());
    let mut dx = vec![0.0; width];
    for (j, delta) in dx.iter_mut().enumerate() {
        let a = current.input.get(j).copied().unwrap_or(0) as f64;
        let b = forbidden.input.get(j).copied().unwrap_or(0) as f64;
        *delta = b - a;
    }

    dy.iter()
        .map(|&d| {
            dx.iter()
                .map(|&delta| if delta != 0.0 { d / delta } else { 0.0 })
                .collect()
        })
        .collect()
}

/// Position-wise embedding distances between two traces; a missing side
/// reads as the origin.
fn trace_distances(graph: &TraceGraph, a: &BlockTrace, b: &BlockTrace) -> Vec<f64> {
    let len = a.len().max(b.len());
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let d = match (a.get(i), b.get(i)) {
            (Some(&na), Some(&nb)) => graph.node_distance(na, nb),
            (Some(&na), None) => graph.node_distance_to_origin(na),
            (None, Some(&nb)) => graph.node_distance_to_origin(nb),
            (None, None) => unreachable!("index below max of both lengths"),
        };
        out.push(d);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Node2VecParams, TraceGraph, DEFAULT_EMBEDDING_DIM};

    fn graph() -> TraceGraph {
        TraceGraph::new(DEFAULT_EMBEDDING_DIM, Node2VecParams::default())
    }

    fn exec(input: &[u8], trace: &[u32]) -> FuzzExecution {
        FuzzExecution::new(input.to_vec(), trace.to_vec())
    }

    #[test]
    fn frozen_bytes_pass_through_unchanged() {
        let g = graph();
        let forbidden = exec(&[10, 20, 30], &[1, 2, 3]);
        let current = exec(&[40, 50, 60], &[4, 5, 6]);
        let mut speed = ExplorationSpeed::new(3);
        speed.freeze_changed(&[0, 0, 0], &[1, 1, 1]);

        let next = descend(&g, &forbidden, &current, &speed);
        assert_eq!(next, vec![40, 50, 60]);
    }

    #[test]
    fn update_clamps_below_zero_and_wraps_above_255() {
        // Descending past zero clamps.
        assert_eq!(update_byte(10, 1.0, 300.0), 0);
        // Climbing past 255 wraps modulo 256.
        assert_eq!(update_byte(200, 1.0, -100.0), 44);
        assert_eq!(update_byte(0, 1.0, -512.0), 0);
        // Small moves round to the nearest byte.
        assert_eq!(update_byte(100, 1.0, 0.3), 100);
        assert_eq!(update_byte(100, 1.0, 0.6), 99);
    }

    #[test]
    fn descend_emits_one_byte_per_input_position() {
        let g = graph();
        let forbidden = exec(&[0, 255, 128, 7], &[1, 2, 3, 4]);
        let current = exec(&[255, 0, 127, 200], &[5, 6, 7, 8]);
        let speed = ExplorationSpeed::new(4);
        let next = descend(&g, &forbidden, &current, &speed);
        assert_eq!(next.len(), 4);
    }

    #[test]
    fn descend_handles_unequal_input_lengths() {
        let g = graph();
        let forbidden = exec(&[1, 2, 3, 4, 5, 6], &[1, 2]);
        let current = exec(&[9, 9], &[3, 4, 5]);
        let speed = ExplorationSpeed::new(6);
        let next = descend(&g, &forbidden, &current, &speed);
        assert_eq!(next.len(), 6);
    }

    #[test]
    #[should_panic(expected = "exploration speed must match")]
    fn mismatched_speed_length_panics() {
        let g = graph();
        let forbidden = exec(&[1, 2], &[1]);
        let current = exec(&[3, 4], &[2]);
        let speed = ExplorationSpeed::new(5);
        descend(&g, &forbidden, &current, &speed);
    }

    #[test]
    fn freeze_marks_exactly_the_changed_bytes() {
        let mut speed = ExplorationSpeed::new(4);
        speed.freeze_changed(&[1, 2, 3, 4], &[1, 9, 3, 7]);
        let etas = speed.as_slice();
        assert_eq!(etas[0], DEFAULT_ETA);
        assert_eq!(etas[1], FREEZE_ETA);
        assert_eq!(etas[2], DEFAULT_ETA);
        assert_eq!(etas[3], FREEZE_ETA);
    }

    #[test]
    fn thaw_recovers_frozen_bytes_over_time() {
        let mut speed = ExplorationSpeed::new(2);
        speed.freeze_changed(&[0, 0], &[1, 1]);
        // While still frozen, each step gains exactly the acceleration.
        for t in 1..=500 {
            speed.thaw(THAW_ACCELERATION);
            let floor = (-1.0 + t as f64 * THAW_ACCELERATION).min(1.0);
            for &eta in speed.as_slice() {
                assert!(eta >= floor - 1e-9, "eta {eta} below thaw floor {floor}");
            }
        }
        // Past the zero crossing, the component is fully mutable again.
        for _ in 0..1000 {
            speed.thaw(THAW_ACCELERATION);
        }
        for &eta in speed.as_slice() {
            assert_eq!(eta, 1.0, "byte did not recover to full speed");
        }
    }

    #[test]
    fn thaw_caps_positive_rates_at_one() {
        let mut speed = ExplorationSpeed::new(1);
        for _ in 0..200_000 {
            speed.thaw(THAW_ACCELERATION);
        }
        assert_eq!(speed.as_slice()[0], 1.0);
    }
}
