pub(crate) const STATES: usize = 12;

/// The 12-state token automaton.
///
/// Each state remembers the kinds of the last one or two decoded tokens;
/// the names read most-recent-last. It selects the `is_match` row and
/// decides whether the next literal uses the matched-literal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub(crate) enum State {
    #[default]
    LitLit = 0,
    MatchLitLit = 1,
    RepLitLit = 2,
    ShortRepLitLit = 3,
    MatchLit = 4,
    RepLit = 5,
    ShortRepLit = 6,
    LitMatch = 7,
    LitLongRep = 8,
    LitShortRep = 9,
    NonLitMatch = 10,
    NonLitRep = 11,
}

impl State {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// True when the last token was a literal; such states use the plain
    /// literal decode path instead of the matched-literal one.
    #[inline]
    pub fn is_literal(self) -> bool {
        self.index() < 7
    }

    pub fn next_literal(self) -> State {
        use State::*;
        match self {
            LitLit | MatchLitLit | RepLitLit | ShortRepLitLit => LitLit,
            MatchLit => MatchLitLit,
            RepLit => RepLitLit,
            ShortRepLit => ShortRepLitLit,
            LitMatch => MatchLit,
            LitLongRep => RepLit,
            LitShortRep => ShortRepLit,
            NonLitMatch => MatchLit,
            NonLitRep => RepLit,
        }
    }

    pub fn next_match(self) -> State {
        if self.is_literal() {
            State::LitMatch
        } else {
            State::NonLitMatch
        }
    }

    pub fn next_long_rep(self) -> State {
        if self.is_literal() {
            State::LitLongRep
        } else {
            State::NonLitRep
        }
    }

    pub fn next_short_rep(self) -> State {
        if self.is_literal() {
            State::LitShortRep
        } else {
            State::NonLitRep
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        *self = State::LitLit;
    }

    #[inline]
    pub fn update_literal(&mut self) {
        *self = self.next_literal();
    }

    #[inline]
    pub fn update_match(&mut self) {
        *self = self.next_match();
    }

    #[inline]
    pub fn update_long_rep(&mut self) {
        *self = self.next_long_rep();
    }

    #[inline]
    pub fn update_short_rep(&mut self) {
        *self = self.next_short_rep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [State; STATES] = [
        State::LitLit,
        State::MatchLitLit,
        State::RepLitLit,
        State::ShortRepLitLit,
        State::MatchLit,
        State::RepLit,
        State::ShortRepLit,
        State::LitMatch,
        State::LitLongRep,
        State::LitShortRep,
        State::NonLitMatch,
        State::NonLitRep,
    ];

    #[test]
    fn literal_transition_table() {
        let expected = [0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 4, 5];
        for (s, want) in ALL.iter().zip(expected) {
            assert_eq!(s.next_literal().index(), want);
        }
    }

    #[test]
    fn match_and_rep_transitions() {
        for s in ALL {
            let i = s.index();
            assert_eq!(s.next_match().index(), if i < 7 { 7 } else { 10 });
            assert_eq!(s.next_long_rep().index(), if i < 7 { 8 } else { 11 });
            assert_eq!(s.next_short_rep().index(), if i < 7 { 9 } else { 11 });
        }
    }

    #[test]
    fn literal_states_are_first_seven() {
        for s in ALL {
            assert_eq!(s.is_literal(), s.index() < 7);
        }
    }
}
