//! The shared document model: an ordered sequence of lines plus a table of
//! named cursors. Pure state — no sockets, no threads, no clocks.
//!
//! Every non-terminal line carries a trailing newline sentinel (`\n`); the
//! last line never does. A cursor's column may legally rest on that
//! sentinel (one past the last visible character) but never past it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The character that terminates every non-final line.
pub const NEWLINE: char = '\n';

/// The cursor id reserved for subscription-negotiation messages that have
/// not yet been assigned a real cursor.
pub const RESERVED_CURSOR_ID: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Left,
  Right,
  Up,
  Down,
  Backspace,
  Delete,
  Enter,
}

impl Direction {
  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      Direction::Left => "left",
      Direction::Right => "right",
      Direction::Up => "up",
      Direction::Down => "down",
      Direction::Backspace => "backspace",
      Direction::Delete => "delete",
      Direction::Enter => "enter",
    }
  }
}

impl fmt::Display for Direction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("unknown move direction: {0:?}")]
pub struct UnknownDirection(());

impl FromStr for Direction {
  type Err = UnknownDirection;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "left" => Ok(Direction::Left),
      "right" => Ok(Direction::Right),
      "up" => Ok(Direction::Up),
      "down" => Ok(Direction::Down),
      "backspace" => Ok(Direction::Backspace),
      "delete" => Ok(Direction::Delete),
      "enter" => Ok(Direction::Enter),
      _ => Err(UnknownDirection(())),
    }
  }
}

/// A participant's position within the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
  pub line: usize,
  pub col: usize,
}

/// The narrow callback surface the document model drives whenever its
/// state changes. A real terminal UI would implement this; the server has
/// no UI and installs [`NullView`].
pub trait EditorView: Send {
  fn add_line(&mut self, pos: usize, text: &str, cursor_cols: &[usize]);
  fn change_line(&mut self, pos: usize, text: &str, cursor_cols: &[usize]);
  fn delete_line(&mut self, pos: usize);
}

/// A view that does nothing. Used by the server, which renders no UI, and
/// by tests that only care about the resulting document state.
#[derive(Debug, Default)]
pub struct NullView;

impl EditorView for NullView {
  fn add_line(&mut self, _pos: usize, _text: &str, _cursor_cols: &[usize]) {}
  fn change_line(&mut self, _pos: usize, _text: &str, _cursor_cols: &[usize]) {}
  fn delete_line(&mut self, _pos: usize) {}
}

/// Lines plus a cursor table, notifying an [`EditorView`] of state changes.
pub struct Document {
  lines: Vec<String>,
  cursors: HashMap<String, Cursor>,
  view: Box<dyn EditorView>,
}

impl fmt::Debug for Document {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Document")
      .field("lines", &self.lines)
      .field("cursors", &self.cursors)
      .finish_non_exhaustive()
  }
}

/// Split raw file content into the line representation this model expects:
/// every line but the last keeps its trailing `\n`.
#[must_use]
pub fn lines_from_content(content: &str) -> Vec<String> {
  if content.is_empty() {
    return Vec::new();
  }
  let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
  // `split` drops no data, but a trailing '\n' in the source produces a
  // spurious empty last element; content without one is exactly the last row.
  if content.ends_with('\n') {
    lines.pop();
  }
  let last = lines.len().saturating_sub(1);
  for (i, line) in lines.iter_mut().enumerate() {
    if i != last {
      line.push(NEWLINE);
    }
  }
  lines
}

impl Document {
  #[must_use]
  pub fn new(lines: Vec<String>) -> Self {
    Self::with_view(lines, Box::new(NullView))
  }

  #[must_use]
  pub fn with_view(lines: Vec<String>, view: Box<dyn EditorView>) -> Self {
    Self {
      lines,
      cursors: HashMap::new(),
      view,
    }
  }

  #[must_use]
  pub fn lines(&self) -> &[String] {
    &self.lines
  }

  #[must_use]
  pub fn cursor(&self, cid: &str) -> Option<Cursor> {
    self.cursors.get(cid).copied()
  }

  #[must_use]
  pub fn cursors(&self) -> &HashMap<String, Cursor> {
    &self.cursors
  }

  /// Concatenate the lines back into file content, ready to write to disk.
  #[must_use]
  pub fn to_content(&self) -> String {
    self.lines.concat()
  }

  fn line_len(&self, idx: usize) -> usize {
    self.lines[idx].chars().count()
  }

  fn is_last_line(&self, idx: usize) -> bool {
    idx + 1 == self.lines.len()
  }

  fn cursor_cols_on_line(&self, line: usize) -> Vec<usize> {
    let mut cols: Vec<usize> = self
      .cursors
      .values()
      .filter(|c| c.line == line)
      .map(|c| c.col)
      .collect();
    cols.sort_unstable();
    cols
  }

  fn notify_changed(&mut self, line: usize) {
    let cols = self.cursor_cols_on_line(line);
    let text = strip_newline(&self.lines[line]).to_string();
    self.view.change_line(line, &text, &cols);
  }

  /// Register a new cursor at `(line, col)`. Used on `subscribe` and when
  /// replaying a `create_cursor` broadcast.
  pub fn create(&mut self, cid: &str, line: usize, col: usize) {
    if self.lines.is_empty() {
      return;
    }
    let line = line.min(self.lines.len() - 1);
    let col = col.min(self.line_len(line).saturating_sub(1));
    self.cursors.insert(cid.to_string(), Cursor { line, col });
  }

  /// Drop a cursor. Used on `unsubscribe`/disconnect and when replaying a
  /// `remove_cursor` broadcast.
  pub fn remove(&mut self, cid: &str) {
    self.cursors.remove(cid);
  }

  /// Replace the whole document with a freshly received snapshot (the
  /// client's late-join install), notifying the view of every line as if
  /// freshly loaded.
  pub fn install_snapshot(&mut self, lines: Vec<String>, cursors: HashMap<String, Cursor>) {
    self.lines = lines;
    self.cursors = cursors;
    for i in 0..self.lines.len() {
      let cols = self.cursor_cols_on_line(i);
      let text = strip_newline(&self.lines[i]).to_string();
      self.view.add_line(i, &text, &cols);
    }
  }

  pub fn move_cursor(&mut self, cid: &str, direction: Direction) {
    if self.lines.is_empty() {
      return;
    }
    let Some(mut cur) = self.cursors.get(cid).copied() else {
      return;
    };
    match direction {
      Direction::Left => {
        if cur.col > 0 {
          cur.col -= 1;
        }
      }
      Direction::Right => {
        if cur.col + 1 < self.line_len(cur.line) {
          cur.col += 1;
        }
      }
      Direction::Up => {
        if cur.line > 0 {
          cur.line -= 1;
          cur.col = cur.col.min(self.line_len(cur.line).saturating_sub(1));
        }
      }
      Direction::Down => {
        if cur.line + 1 < self.lines.len() {
          cur.line += 1;
          cur.col = cur.col.min(self.line_len(cur.line).saturating_sub(1));
        }
      }
      Direction::Backspace => {
        if cur.col > 0 {
          self.delete_char_at(cur.line, cur.col - 1);
          cur.col -= 1;
        } else if cur.line > 0 {
          cur = self.join_into_previous(cur.line);
        }
        self.cursors.insert(cid.to_string(), cur);
        self.retarget_cursors_after_edit(cid);
        return;
      }
      Direction::Delete => {
        let len = self.line_len(cur.line);
        let at_sentinel = !self.is_last_line(cur.line) && cur.col + 1 == len;
        let at_eof = self.is_last_line(cur.line) && cur.col + 1 == len;
        if at_eof {
          // No-op: nothing follows the last visible character of the document.
        } else if at_sentinel {
          self.join_next_into(cur.line);
        } else {
          self.delete_char_at(cur.line, cur.col);
        }
        self.cursors.insert(cid.to_string(), cur);
        self.retarget_cursors_after_edit(cid);
        return;
      }
      Direction::Enter => {
        self.split_line_at(cur.line, cur.col);
        cur.line += 1;
        cur.col = 0;
        self.cursors.insert(cid.to_string(), cur);
        self.retarget_cursors_after_edit(cid);
        return;
      }
    }
    self.cursors.insert(cid.to_string(), cur);
  }

  pub fn insert_char(&mut self, cid: &str, c: char) {
    if self.lines.is_empty() {
      return;
    }
    let Some(cur) = self.cursors.get(cid).copied() else {
      return;
    };
    if c == NEWLINE {
      self.move_cursor(cid, Direction::Enter);
      return;
    }
    let mut chars: Vec<char> = self.lines[cur.line].chars().collect();
    chars.insert(cur.col, c);
    self.lines[cur.line] = chars.into_iter().collect();
    self.notify_changed(cur.line);
    // Every cursor at or after the insertion point on this line shifts
    // right by one, including the inserting cursor itself — a sibling
    // parked further along the same line must not end up mid-character.
    self.shift_cursors_on_line(cur.line, cur.col, 1);
  }

  fn delete_char_at(&mut self, line: usize, col: usize) {
    let mut chars: Vec<char> = self.lines[line].chars().collect();
    if col >= chars.len() {
      return;
    }
    chars.remove(col);
    self.lines[line] = chars.into_iter().collect();
    self.notify_changed(line);
    // Cursors strictly after the deleted character shift left by one; a
    // cursor sitting on the deleted character itself is unaffected.
    self.shift_cursors_on_line(line, col + 1, -1);
  }

  /// Shift every cursor on `line` whose column is at or past `from` by
  /// `delta` (positive or negative), clamped so no cursor goes negative.
  fn shift_cursors_on_line(&mut self, line: usize, from: usize, delta: isize) {
    for cur in self.cursors.values_mut() {
      if cur.line == line && cur.col >= from {
        cur.col = (cur.col as isize + delta).max(0) as usize;
      }
    }
  }

  /// Merge `line` onto `line - 1` (backspace at column 0). Returns the
  /// cursor's new position.
  fn join_into_previous(&mut self, line: usize) -> Cursor {
    let prev = line - 1;
    let new_col = self.line_len(prev) - 1;
    let tail = self.lines.remove(line);
    self.lines[prev] = format!("{}{}", strip_newline(&self.lines[prev]), tail);
    self.view.delete_line(line);
    self.notify_changed(prev);
    Cursor {
      line: prev,
      col: new_col,
    }
  }

  /// Merge `line + 1` onto `line` (delete at a newline sentinel).
  fn join_next_into(&mut self, line: usize) {
    let next = self.lines.remove(line + 1);
    self.lines[line] = format!("{}{}", strip_newline(&self.lines[line]), next);
    self.view.delete_line(line + 1);
    self.notify_changed(line);
  }

  /// Split `line` at `col` into two lines (enter / inserting a newline).
  fn split_line_at(&mut self, line: usize, col: usize) {
    let chars: Vec<char> = self.lines[line].chars().collect();
    let before: String = chars[..col].iter().collect();
    let after: String = chars[col..].iter().collect();
    self.lines[line] = format!("{before}{NEWLINE}");
    self.lines.insert(line + 1, after.clone());
    self.notify_changed(line);
    self.view.add_line(line + 1, &after, &[]);
  }

  /// After a structural edit (line count changed), clamp every other
  /// cursor so invariant 1 still holds; line joins/splits can leave a
  /// sibling cursor pointing past the end of a shrunk or removed line.
  fn retarget_cursors_after_edit(&mut self, editor: &str) {
    let max_line = self.lines.len().saturating_sub(1);
    let lens: Vec<usize> = self.lines.iter().map(|l| l.chars().count()).collect();
    for (cid, cur) in &mut self.cursors {
      if cid == editor {
        continue;
      }
      cur.line = cur.line.min(max_line);
      let len = lens[cur.line];
      cur.col = cur.col.min(len.saturating_sub(1));
    }
  }
}

fn strip_newline(line: &str) -> &str {
  line.strip_suffix(NEWLINE).unwrap_or(line)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn doc(lines: &[&str]) -> Document {
    Document::new(lines.iter().map(|s| (*s).to_string()).collect())
  }

  #[test]
  fn lines_from_content_splits_and_terminates_non_final_lines() {
    assert_eq!(lines_from_content("abc\ndef"), vec!["abc\n", "def"]);
    assert_eq!(lines_from_content("abc\ndef\n"), vec!["abc\n", "def"]);
    assert_eq!(lines_from_content(""), Vec::<String>::new());
  }

  #[test]
  fn backspace_at_column_zero_joins_lines() {
    let mut d = doc(&["ab\n", "cd"]);
    d.create("u1", 1, 0);
    d.move_cursor("u1", Direction::Backspace);
    assert_eq!(d.lines(), &["abcd".to_string()]);
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 0, col: 2 }));
  }

  #[test]
  fn enter_at_end_of_line_splits_and_terminates_new_last_line() {
    let mut d = doc(&["abc"]);
    d.create("u1", 0, 3);
    d.move_cursor("u1", Direction::Enter);
    assert_eq!(d.lines(), &["abc\n".to_string(), String::new()]);
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 1, col: 0 }));
  }

  #[test]
  fn right_stops_on_newline_sentinel_and_never_overshoots() {
    let mut d = doc(&["ab\n", "cd"]);
    d.create("u1", 0, 0);
    for _ in 0..10 {
      d.move_cursor("u1", Direction::Right);
    }
    // "ab\n" has intrinsic length 3; max column is 2 (the sentinel itself).
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 0, col: 2 }));
  }

  #[test]
  fn delete_on_last_line_final_column_is_noop() {
    let mut d = doc(&["abc"]);
    d.create("u1", 0, 2);
    d.move_cursor("u1", Direction::Delete);
    assert_eq!(d.lines(), &["abc".to_string()]);
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 0, col: 2 }));
  }

  #[test]
  fn delete_on_newline_sentinel_joins_next_line() {
    let mut d = doc(&["ab\n", "cd"]);
    d.create("u1", 0, 2);
    d.move_cursor("u1", Direction::Delete);
    assert_eq!(d.lines(), &["abcd".to_string()]);
  }

  #[test]
  fn insert_char_advances_column_and_preserves_invariant() {
    let mut d = doc(&["ac"]);
    d.create("u1", 0, 1);
    d.insert_char("u1", 'b');
    assert_eq!(d.lines(), &["abc".to_string()]);
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 0, col: 2 }));
  }

  #[test]
  fn insert_char_shifts_sibling_cursor_sharing_the_line() {
    let mut d = doc(&["ac"]);
    d.create("u1", 0, 1);
    d.create("u2", 0, 2);
    d.insert_char("u1", 'b');
    assert_eq!(d.lines(), &["abc".to_string()]);
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 0, col: 2 }));
    assert_eq!(d.cursor("u2"), Some(Cursor { line: 0, col: 3 }));
  }

  #[test]
  fn delete_shifts_sibling_cursor_back_but_not_one_sitting_on_the_deleted_char() {
    let mut d = doc(&["abcd"]);
    d.create("u1", 0, 1);
    d.create("u2", 0, 1);
    d.create("u3", 0, 3);
    d.move_cursor("u1", Direction::Delete);
    assert_eq!(d.lines(), &["acd".to_string()]);
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 0, col: 1 }));
    assert_eq!(d.cursor("u2"), Some(Cursor { line: 0, col: 1 }));
    assert_eq!(d.cursor("u3"), Some(Cursor { line: 0, col: 2 }));
  }

  #[test]
  fn backspace_shifts_sibling_cursor_sharing_the_line() {
    let mut d = doc(&["abcd"]);
    d.create("u1", 0, 2);
    d.create("u2", 0, 3);
    d.move_cursor("u1", Direction::Backspace);
    assert_eq!(d.lines(), &["acd".to_string()]);
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 0, col: 1 }));
    assert_eq!(d.cursor("u2"), Some(Cursor { line: 0, col: 2 }));
  }

  #[test]
  fn insert_newline_char_behaves_like_enter() {
    let mut d = doc(&["abc"]);
    d.create("u1", 0, 1);
    d.insert_char("u1", NEWLINE);
    assert_eq!(d.lines(), &["a\n".to_string(), "bc".to_string()]);
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 1, col: 0 }));
  }

  #[test]
  fn up_down_clamp_column_to_shorter_line() {
    let mut d = doc(&["abcdef\n", "xy"]);
    d.create("u1", 0, 5);
    d.move_cursor("u1", Direction::Down);
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 1, col: 1 }));
    d.move_cursor("u1", Direction::Up);
    assert_eq!(d.cursor("u1"), Some(Cursor { line: 0, col: 1 }));
  }

  #[test]
  fn operations_on_empty_document_are_rejected_as_noop() {
    let mut d = doc(&[]);
    d.create("u1", 0, 0);
    assert_eq!(d.cursor("u1"), None);
    d.move_cursor("u1", Direction::Left);
    d.insert_char("u1", 'x');
    assert!(d.lines().is_empty());
  }

  #[test]
  fn direction_round_trips_through_str() {
    for dir in [
      Direction::Left,
      Direction::Right,
      Direction::Up,
      Direction::Down,
      Direction::Backspace,
      Direction::Delete,
      Direction::Enter,
    ] {
      assert_eq!(Direction::from_str(dir.as_str()).unwrap(), dir);
    }
    assert!(Direction::from_str("sideways").is_err());
  }
}
