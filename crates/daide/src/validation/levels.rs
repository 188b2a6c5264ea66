/// Numbered syntax levels with their display names, in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxLevels {
    levels: Vec<(i32, String)>,
}

const FALLBACK_LADDER: [i32; 15] = [0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120, 130, 8000];

impl SyntaxLevels {
    pub fn new(mut levels: Vec<(i32, String)>) -> Self {
        levels.sort_by_key(|(level, _)| *level);
        levels.dedup_by_key(|(level, _)| *level);
        Self { levels }
    }

    pub fn fallback() -> Self {
        Self {
            levels: FALLBACK_LADDER
                .iter()
                .map(|level| (*level, format!("Level {}", level)))
                .collect(),
        }
    }

    pub fn levels(&self) -> &[(i32, String)] {
        &self.levels
    }

    pub fn name(&self, level: i32) -> Option<&str> {
        self.levels
            .iter()
            .find(|(l, _)| *l == level)
            .map(|(_, name)| name.as_str())
    }

    /// The highest known level not above `requested`, for negotiating with
    /// a peer that asks for a level this side lacks.
    pub fn negotiate(&self, requested: i32) -> Option<i32> {
        self.levels
            .iter()
            .map(|(level, _)| *level)
            .filter(|level| *level <= requested)
            .max()
    }
}

impl Default for SyntaxLevels {
    fn default() -> Self {
        Self::fallback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_ladder() {
        let levels = SyntaxLevels::fallback();
        assert_eq!(levels.levels().len(), 15);
        assert_eq!(levels.levels().last().map(|(l, _)| *l), Some(8000));
        assert_eq!(levels.name(130), Some("Level 130"));
    }

    #[test]
    fn test_negotiate() {
        let levels = SyntaxLevels::new(vec![
            (20, "Order Proposals".into()),
            (0, "No Press".into()),
            (10, "Peace and Alliances".into()),
        ]);
        assert_eq!(levels.levels()[0].0, 0);
        assert_eq!(levels.negotiate(15), Some(10));
        assert_eq!(levels.negotiate(100), Some(20));
        assert_eq!(levels.negotiate(-1), None);
        assert_eq!(levels.name(10), Some("Peace and Alliances"));
    }
}
