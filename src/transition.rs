//! Table-driven state transition guard.
//!
//! A transition map is plain data: each state lists the states it may move
//! to. Adding a state means adding a row, not a branch.

use crate::error::{Error, Result};
use std::fmt::Display;

/// `(from, allowed targets)` rows.
pub type TransitionMap<S> = &'static [(S, &'static [S])];

/// States a given `from` may move to. Unlisted states have no exits.
pub fn allowed_from<S: Copy + Eq>(map: TransitionMap<S>, from: S) -> &'static [S] {
    map.iter()
        .find(|(state, _)| *state == from)
        .map(|(_, allowed)| *allowed)
        .unwrap_or(&[])
}

/// Reject `from -> to` unless the map allows it. `from == to` is a no-op.
pub fn assert_valid_transition<S>(
    entity: &'static str,
    map: TransitionMap<S>,
    from: S,
    to: S,
) -> Result<()>
where
    S: Copy + Eq + Display,
{
    if from == to {
        return Ok(());
    }

    let allowed = allowed_from(map, from);
    if allowed.contains(&to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
            allowed: allowed.iter().map(ToString::to_string).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Red,
        Green,
        Yellow,
        Broken,
    }

    impl Display for Light {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    const LIGHTS: TransitionMap<Light> = &[
        (Light::Red, &[Light::Green, Light::Broken]),
        (Light::Green, &[Light::Yellow, Light::Broken]),
        (Light::Yellow, &[Light::Red, Light::Broken]),
    ];

    #[test]
    fn same_state_is_noop() {
        assert!(assert_valid_transition("light", LIGHTS, Light::Broken, Light::Broken).is_ok());
    }

    #[test]
    fn listed_transition_passes() {
        assert!(assert_valid_transition("light", LIGHTS, Light::Red, Light::Green).is_ok());
    }

    #[test]
    fn unlisted_transition_carries_context() {
        let err = assert_valid_transition("light", LIGHTS, Light::Red, Light::Yellow).unwrap_err();
        match err {
            Error::InvalidTransition {
                entity,
                from,
                to,
                allowed,
            } => {
                assert_eq!(entity, "light");
                assert_eq!(from, "Red");
                assert_eq!(to, "Yellow");
                assert_eq!(allowed, vec!["Green".to_string(), "Broken".to_string()]);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    #[test]
    fn state_without_row_has_no_exits() {
        assert!(assert_valid_transition("light", LIGHTS, Light::Broken, Light::Red).is_err());
        assert!(allowed_from(LIGHTS, Light::Broken).is_empty());
    }
}
