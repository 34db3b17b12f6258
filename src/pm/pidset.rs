use serde::Serialize;
use std::fmt;

/// Ordered process ids that together make up one running instance.
///
/// Pid-file form is a single line of whitespace separated decimal ids. Readers accept any
/// number of lines and flatten them, skipping tokens that are not pids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PidSet(Vec<u32>);

impl PidSet {
    pub fn new(pids: Vec<u32>) -> Self {
        Self(pids)
    }

    pub fn parse(content: &str) -> Self {
        let pids = content
            .lines()
            .flat_map(|line| line.split_whitespace())
            .filter_map(|tok| tok.parse::<u32>().ok())
            .filter(|pid| *pid > 0)
            .collect();
        Self(pids)
    }

    /// Pid-file body: one line, trailing newline.
    pub fn render(&self) -> String {
        format!("{self}\n")
    }

    pub fn push(&mut self, pid: u32) {
        self.0.push(pid);
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.0.contains(&pid)
    }
}

impl fmt::Display for PidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for pid in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{pid}")?;
            first = false;
        }
        Ok(())
    }
}

impl From<Vec<u32>> for PidSet {
    fn from(pids: Vec<u32>) -> Self {
        Self(pids)
    }
}

impl FromIterator<u32> for PidSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flattens_lines() {
        let set = PidSet::parse("101 102\n103\n");
        assert_eq!(set.as_slice(), &[101, 102, 103]);
    }

    #[test]
    fn parse_skips_garbage_tokens() {
        let set = PidSet::parse("  42\tabc -7 0 43 \n\n");
        assert_eq!(set.as_slice(), &[42, 43]);
    }

    #[test]
    fn render_is_single_line() {
        let set = PidSet::new(vec![5, 6]);
        assert_eq!(set.render(), "5 6\n");
        assert_eq!(PidSet::default().render(), "\n");
    }

    #[test]
    fn render_then_parse_keeps_order() {
        let set = PidSet::new(vec![900, 12, 400]);
        assert_eq!(PidSet::parse(&set.render()), set);
    }
}
