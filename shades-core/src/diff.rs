//! Line-level diffing used for reformat statistics and comparison output.
//!
//! Texts are split into lines that keep their terminators, so `"a"` and
//! `"a\n"` are different lines. The edit script is a minimal one (Myers),
//! which makes the added/removed counts symmetric: swapping the inputs
//! swaps the counts.

use std::fmt::Write;

const CONTEXT_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal(usize, usize),
    Delete(usize),
    Insert(usize),
}

/// Count `(added, removed)` lines needed to turn `old` into `new`.
pub fn line_changes(old: &str, new: &str) -> (usize, usize) {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    edit_script(&old_lines, &new_lines)
        .iter()
        .fold((0, 0), |(added, removed), edit| match edit {
            Edit::Insert(_) => (added + 1, removed),
            Edit::Delete(_) => (added, removed + 1),
            Edit::Equal(..) => (added, removed),
        })
}

/// Render a unified diff between `old` and `new`.
///
/// Returns an empty string when the texts are identical. Lines without a
/// trailing newline are followed by the usual `\ No newline at end of file`
/// marker.
pub fn unified_diff(old: &str, new: &str, old_name: &str, new_name: &str) -> String {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    let edits = edit_script(&old_lines, &new_lines);
    if edits.iter().all(|edit| matches!(edit, Edit::Equal(..))) {
        return String::new();
    }

    let mut output = String::new();
    let _ = writeln!(output, "--- {old_name}");
    let _ = writeln!(output, "+++ {new_name}");
    for (start, end) in hunk_ranges(&edits) {
        let hunk = &edits[start..end];
        let (old_start, old_len) = side_range(hunk, |edit| match edit {
            Edit::Equal(a, _) | Edit::Delete(a) => Some(*a),
            Edit::Insert(_) => None,
        });
        let (new_start, new_len) = side_range(hunk, |edit| match edit {
            Edit::Equal(_, b) | Edit::Insert(b) => Some(*b),
            Edit::Delete(_) => None,
        });
        let old_start = old_start.unwrap_or_else(|| preceding_old_line(&edits, start));
        let new_start = new_start.unwrap_or_else(|| preceding_new_line(&edits, start));
        let _ = writeln!(
            output,
            "@@ -{} +{} @@",
            format_range(old_start, old_len),
            format_range(new_start, new_len)
        );
        for edit in hunk {
            match edit {
                Edit::Equal(a, _) => push_line(&mut output, ' ', old_lines[*a]),
                Edit::Delete(a) => push_line(&mut output, '-', old_lines[*a]),
                Edit::Insert(b) => push_line(&mut output, '+', new_lines[*b]),
            }
        }
    }
    output
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

fn push_line(output: &mut String, marker: char, line: &str) {
    output.push(marker);
    output.push_str(line);
    if !line.ends_with('\n') {
        output.push_str("\n\\ No newline at end of file\n");
    }
}

/// difflib-style range: 1-based start, omitted length when it is one, and
/// a start pointing before the hunk when the side is empty.
fn format_range(start: usize, len: usize) -> String {
    let beginning = if len == 0 { start } else { start + 1 };
    if len == 1 {
        format!("{beginning}")
    } else {
        format!("{beginning},{len}")
    }
}

fn side_range(hunk: &[Edit], index: impl Fn(&Edit) -> Option<usize>) -> (Option<usize>, usize) {
    let indices: Vec<usize> = hunk.iter().filter_map(index).collect();
    (indices.first().copied(), indices.len())
}

fn preceding_old_line(edits: &[Edit], start: usize) -> usize {
    edits[..start]
        .iter()
        .filter(|edit| !matches!(edit, Edit::Insert(_)))
        .count()
}

fn preceding_new_line(edits: &[Edit], start: usize) -> usize {
    edits[..start]
        .iter()
        .filter(|edit| !matches!(edit, Edit::Delete(_)))
        .count()
}

/// Group edits into hunks with surrounding context, merging hunks whose
/// context would overlap.
fn hunk_ranges(edits: &[Edit]) -> Vec<(usize, usize)> {
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (index, edit) in edits.iter().enumerate() {
        if matches!(edit, Edit::Equal(..)) {
            continue;
        }
        let start = index.saturating_sub(CONTEXT_LINES);
        let end = (index + 1 + CONTEXT_LINES).min(edits.len());
        match ranges.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => ranges.push((start, end)),
        }
    }
    ranges
}

fn edit_script(old: &[&str], new: &[&str]) -> Vec<Edit> {
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_middle = &old[prefix..old.len() - suffix];
    let new_middle = &new[prefix..new.len() - suffix];

    let mut edits: Vec<Edit> = (0..prefix).map(|i| Edit::Equal(i, i)).collect();
    edits.extend(myers(old_middle, new_middle).into_iter().map(|edit| match edit {
        Edit::Equal(a, b) => Edit::Equal(a + prefix, b + prefix),
        Edit::Delete(a) => Edit::Delete(a + prefix),
        Edit::Insert(b) => Edit::Insert(b + prefix),
    }));
    let old_tail = old.len() - suffix;
    let new_tail = new.len() - suffix;
    edits.extend((0..suffix).map(|i| Edit::Equal(old_tail + i, new_tail + i)));
    edits
}

fn myers(old: &[&str], new: &[&str]) -> Vec<Edit> {
    let n = old.len() as isize;
    let m = new.len() as isize;
    let max = (n + m) as usize;
    let offset = max as isize;
    let mut frontier = vec![0isize; 2 * max + 2];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'search: for d in 0..=max as isize {
        trace.push(frontier.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && frontier[idx - 1] < frontier[idx + 1]) {
                frontier[idx + 1]
            } else {
                frontier[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && old[x as usize] == new[y as usize] {
                x += 1;
                y += 1;
            }
            frontier[idx] = x;
            if x >= n && y >= m {
                break 'search;
            }
            k += 2;
        }
    }

    let mut edits = Vec::new();
    let (mut x, mut y) = (n, m);
    for (d, snapshot) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;
        let prev_k = if k == -d
            || (k != d && snapshot[(k - 1 + offset) as usize] < snapshot[(k + 1 + offset) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = snapshot[(prev_k + offset) as usize];
        let prev_y = prev_x - prev_k;
        while x > prev_x && y > prev_y {
            edits.push(Edit::Equal((x - 1) as usize, (y - 1) as usize));
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                edits.push(Edit::Insert((y - 1) as usize));
            } else {
                edits.push(Edit::Delete((x - 1) as usize));
            }
        }
        x = prev_x;
        y = prev_y;
    }
    edits.reverse();
    edits
}
