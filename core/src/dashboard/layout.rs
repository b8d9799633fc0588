//! # Layout Engine
//!
//! Turns rows of weighted component ids into positioned cells.
//!
//! Vertically every row starts at its minimum height and the slack is spread
//! evenly over the data rows (the first row is the header and stays fixed).
//! Horizontally each component gets its minimum width, the remainder is split
//! by weight with largest-remainder rounding, every non-last column gains one
//! cell so adjacent borders can merge, and the rightmost columns give that
//! back. A row that cannot fit degrades to its essential panels, or is
//! clamped outright on very narrow terminals.
//!
//! Postconditions for every row: `Σ w ≤ width` and cells never overlap.

use super::component::{ComponentId, DEFAULT_MIN_WIDTH};

pub const WARN_TOO_NARROW: &str = "Terminal too narrow — display truncated";
pub const WARN_PANELS_HIDDEN: &str = "Some panels hidden";

/// Below this width a row is clamped instead of degraded.
const MIN_DEGRADE_WIDTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSpec {
    pub ids: Vec<ComponentId>,
    /// One positive weight per id. Missing entries count as 1.
    pub weights: Vec<u16>,
    pub min_height: u16,
}

impl RowSpec {
    pub fn new(ids: Vec<ComponentId>, weights: Vec<u16>, min_height: u16) -> Self {
        Self {
            ids,
            weights,
            min_height,
        }
    }

    fn weight(&self, i: usize) -> usize {
        self.weights.get(i).copied().unwrap_or(1).max(1) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub id: ComponentId,
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    pub cells: Vec<Cell>,
    pub warning: Option<&'static str>,
}

/// Lays out `rows` in a `width` x `height` area. `min_width` reports a
/// component's minimum width, `None` for unknown ids.
pub fn compute(
    rows: &[RowSpec],
    width: u16,
    height: u16,
    min_width: &dyn Fn(ComponentId) -> Option<u16>,
) -> Layout {
    let heights = row_heights(rows, height);
    let mut layout = Layout::default();
    let mut y = 0u16;

    for (row, h) in rows.iter().zip(heights) {
        if y >= height {
            break;
        }
        let h = h.min(height - y);
        let weights: Vec<usize> = (0..row.ids.len()).map(|i| row.weight(i)).collect();
        let (widths, warning) = row_widths(&row.ids, &weights, width as usize, min_width);
        if layout.warning.is_none() {
            layout.warning = warning;
        } else if warning == Some(WARN_TOO_NARROW) {
            layout.warning = warning;
        }

        let mut x = 0usize;
        for (id, w) in widths {
            layout.cells.push(Cell {
                id,
                x: x as u16,
                y,
                w: w as u16,
                h,
            });
            x += w;
        }
        y = y.saturating_add(h);
    }
    layout
}

/// Minimum heights plus the vertical slack spread over the data rows.
pub fn row_heights(rows: &[RowSpec], height: u16) -> Vec<u16> {
    let mut heights: Vec<u16> = rows.iter().map(|r| r.min_height).collect();
    let used: usize = heights.iter().map(|&h| h as usize).sum();
    let slack = (height as usize).saturating_sub(used);
    if slack > 0 && rows.len() >= 2 {
        let data_rows = rows.len() - 1;
        let each = slack / data_rows;
        let extra = slack % data_rows;
        for (i, h) in heights.iter_mut().skip(1).enumerate() {
            let add = each + usize::from(i < extra);
            *h = h.saturating_add(add as u16);
        }
    }
    heights
}

fn row_widths(
    ids: &[ComponentId],
    weights: &[usize],
    width: usize,
    min_width: &dyn Fn(ComponentId) -> Option<u16>,
) -> (Vec<(ComponentId, usize)>, Option<&'static str>) {
    if ids.is_empty() {
        return (Vec::new(), None);
    }
    let mins: Vec<usize> = ids
        .iter()
        .map(|&id| min_width(id).unwrap_or(DEFAULT_MIN_WIDTH) as usize)
        .collect();
    if mins.iter().sum::<usize>() > width {
        return degrade(ids, width, min_width);
    }

    let mut widths = distribute(&mins, weights, width);

    // Border overlap, then give it back from the right.
    let last = widths.len() - 1;
    for w in &mut widths[..last] {
        *w += 1;
    }
    let mut excess = widths.iter().sum::<usize>().saturating_sub(width);
    for i in (0..widths.len()).rev() {
        if excess == 0 {
            break;
        }
        let take = excess.min(widths[i].saturating_sub(mins[i]));
        widths[i] -= take;
        excess -= take;
    }
    enforce_width(&mut widths, width);

    (ids.iter().copied().zip(widths).collect(), None)
}

/// `mins` plus `width − Σ mins` split by weight, summing to exactly `width`.
fn distribute(mins: &[usize], weights: &[usize], width: usize) -> Vec<usize> {
    let rem = width - mins.iter().sum::<usize>();
    let total: usize = weights.iter().sum::<usize>().max(1);

    let mut widths: Vec<usize> = mins
        .iter()
        .zip(weights)
        .map(|(&min, &weight)| min + rem * weight / total)
        .collect();

    let mut order: Vec<usize> = (0..mins.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(rem * weights[i] % total));
    let mut leftover = width - widths.iter().sum::<usize>();
    for &i in order.iter().cycle() {
        if leftover == 0 {
            break;
        }
        widths[i] += 1;
        leftover -= 1;
    }
    widths
}

/// Trims from the right, ignoring minimums, until `Σ w ≤ width`.
fn enforce_width(widths: &mut [usize], width: usize) {
    let mut excess = widths.iter().sum::<usize>().saturating_sub(width);
    for w in widths.iter_mut().rev() {
        if excess == 0 {
            break;
        }
        let take = excess.min(*w);
        *w -= take;
        excess -= take;
    }
}

fn degrade(
    ids: &[ComponentId],
    width: usize,
    min_width: &dyn Fn(ComponentId) -> Option<u16>,
) -> (Vec<(ComponentId, usize)>, Option<&'static str>) {
    let mut kept: Vec<ComponentId> = ids.iter().copied().filter(|id| id.is_essential()).collect();
    if kept.is_empty() {
        kept.push(ids[0]);
    }

    if kept.len() == ids.len() || width < MIN_DEGRADE_WIDTH {
        return (clamp(&kept, width), Some(WARN_TOO_NARROW));
    }

    let unit = vec![1; kept.len()];
    let (widths, warning) = row_widths(&kept, &unit, width, min_width);
    (widths, warning.or(Some(WARN_PANELS_HIDDEN)))
}

/// Equal split of `width`, remainder to the leftmost ids. Trailing ids are
/// dropped when there are more ids than cells.
fn clamp(ids: &[ComponentId], width: usize) -> Vec<(ComponentId, usize)> {
    let k = ids.len().min(width);
    if k == 0 {
        return Vec::new();
    }
    let each = width / k;
    let extra = width % k;
    ids[..k]
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, each + usize::from(i < extra)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ComponentId::*;

    fn mins(id: ComponentId) -> Option<u16> {
        Some(match id {
            Header => 20,
            NodeStatus | ChainStatus => 24,
            System | Peers => 30,
            Validators => 40,
            Logs => return None,
        })
    }

    fn widths(layout: &Layout, y: u16) -> Vec<u16> {
        layout.cells.iter().filter(|c| c.y == y).map(|c| c.w).collect()
    }

    fn assert_conserved(layout: &Layout, width: u16) {
        let mut rows: Vec<u16> = layout.cells.iter().map(|c| c.y).collect();
        rows.dedup();
        for y in rows {
            let cells: Vec<&Cell> = layout.cells.iter().filter(|c| c.y == y).collect();
            let total: u32 = cells.iter().map(|c| c.w as u32).sum();
            assert!(total <= width as u32, "row {y}: {total} > {width}");
            for pair in cells.windows(2) {
                assert!(pair[0].x + pair[0].w <= pair[1].x, "overlap in row {y}");
            }
        }
    }

    #[test]
    fn equal_weights_split_evenly_then_trim_right() {
        let rows = [RowSpec::new(vec![System, Peers], vec![1, 1], 5)];
        let layout = compute(&rows, 100, 5, &mins);
        assert_eq!(widths(&layout, 0), vec![51, 49]);
        assert_eq!(layout.cells[1].x, 51);
        assert_eq!(layout.warning, None);
    }

    #[test]
    fn weights_bias_the_remainder() {
        let rows = [RowSpec::new(vec![Logs, Validators], vec![2, 1], 5)];
        // mins 20 (unknown) + 40, rem 40 → 26/13 + 1 leftover to the larger fraction.
        let layout = compute(&rows, 100, 5, &mins);
        let w = widths(&layout, 0);
        assert_eq!(w.iter().sum::<u16>(), 100);
        assert_eq!(w, vec![48, 52]);
    }

    #[test]
    fn slack_goes_to_data_rows() {
        let rows = [
            RowSpec::new(vec![Header], vec![1], 3),
            RowSpec::new(vec![NodeStatus, ChainStatus], vec![1, 1], 5),
            RowSpec::new(vec![Logs], vec![1], 5),
        ];
        assert_eq!(row_heights(&rows, 20), vec![3, 9, 8]);
        assert_eq!(row_heights(&rows, 10), vec![3, 5, 5]);
        assert_eq!(row_heights(&rows[..1], 40), vec![3]);
    }

    #[test]
    fn narrow_row_keeps_essentials() {
        let rows = [RowSpec::new(vec![NodeStatus, System, Peers], vec![1, 1, 1], 5)];
        let layout = compute(&rows, 50, 5, &mins);
        let ids: Vec<ComponentId> = layout.cells.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![NodeStatus]);
        assert_eq!(widths(&layout, 0), vec![50]);
        assert_eq!(layout.warning, Some(WARN_PANELS_HIDDEN));
    }

    #[test]
    fn non_essential_row_keeps_first() {
        let rows = [RowSpec::new(vec![System, Peers], vec![1, 1], 5)];
        let layout = compute(&rows, 45, 5, &mins);
        assert_eq!(layout.cells.len(), 1);
        assert_eq!(layout.cells[0].id, System);
        assert_eq!(layout.warning, Some(WARN_PANELS_HIDDEN));
    }

    #[test]
    fn very_narrow_terminal_is_clamped() {
        let rows = [RowSpec::new(vec![NodeStatus, ChainStatus], vec![1, 1], 5)];
        let layout = compute(&rows, 9, 5, &mins);
        assert_eq!(widths(&layout, 0), vec![5, 4]);
        assert_eq!(layout.warning, Some(WARN_TOO_NARROW));

        let layout = compute(&rows, 1, 5, &mins);
        assert_eq!(layout.cells.len(), 1);
        assert!(compute(&rows, 0, 5, &mins).cells.is_empty());
    }

    #[test]
    fn rows_beyond_height_are_dropped() {
        let rows = [
            RowSpec::new(vec![Header], vec![1], 3),
            RowSpec::new(vec![Logs], vec![1], 5),
        ];
        let layout = compute(&rows, 80, 4, &mins);
        assert_eq!(layout.cells.len(), 2);
        assert_eq!(layout.cells[1].h, 1);
        assert_eq!(compute(&rows, 80, 3, &mins).cells.len(), 1);
    }

    #[test]
    fn width_is_conserved_across_sizes() {
        let rows = [
            RowSpec::new(vec![Header], vec![1], 3),
            RowSpec::new(vec![NodeStatus, ChainStatus, System], vec![1, 1, 1], 8),
            RowSpec::new(vec![Peers, Validators], vec![1, 2], 8),
            RowSpec::new(vec![Logs], vec![1], 6),
        ];
        for width in 0..=220 {
            assert_conserved(&compute(&rows, width, 40, &mins), width);
        }
    }
}
