//! Decides on which timesteps periodic actions happen

use crate::setup::{Configuration, InputError};

/// Fires every `period` steps from `start` up to and including `end`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TimeSelection {
    start: usize,
    end: usize,
    period: usize,
}

impl TimeSelection {
    pub fn never() -> Self {
        TimeSelection {start: 0, end: 0, period: 0}
    }

    pub fn every(period: usize) -> Self {
        TimeSelection {start: 0, end: usize::MAX, period}
    }

    pub fn new(start: usize, end: usize, period: usize) -> Self {
        TimeSelection {start, end, period}
    }

    /// Reads `field` as either a period or a `[start, end, period]` list.
    /// A missing field means the action never happens.
    pub fn from_config(input: &Configuration, section: &str, field: &str) -> Result<Self, InputError> {
        if !input.has(section) {
            return Ok(TimeSelection::never());
        }
        let values = match input.integers(section, field) {
            Ok(v) => v,
            Err(InputError::MissingField(..)) => return Ok(TimeSelection::never()),
            Err(e) => return Err(e),
        };
        if values.iter().any(|&v| v < 0) {
            return Err(InputError::CouldNotParse(field.to_owned(), format!("{:?}", values)));
        }
        match values[..] {
            [period] => Ok(TimeSelection::every(period as usize)),
            [start, end, period] => Ok(TimeSelection::new(start as usize, end as usize, period as usize)),
            _ => Err(InputError::CouldNotParse(field.to_owned(), format!("{:?}", values))),
        }
    }

    pub fn the_time_is_now(&self, itime: usize) -> bool {
        self.period > 0
            && itime >= self.start
            && itime <= self.end
            && (itime - self.start) % self.period == 0
    }

    pub fn is_never(&self) -> bool {
        self.period == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_selection() {
        let every = TimeSelection::every(5);
        let hits: Vec<usize> = (1..=20).filter(|&i| every.the_time_is_now(i)).collect();
        assert_eq!(hits, vec![5, 10, 15, 20]);

        let window = TimeSelection::new(3, 11, 4);
        let hits: Vec<usize> = (0..=20).filter(|&i| window.the_time_is_now(i)).collect();
        assert_eq!(hits, vec![3, 7, 11]);

        assert!((0..100).all(|i| !TimeSelection::never().the_time_is_now(i)));
    }

    #[test]
    fn parsed_from_input() {
        let text = "
diagnostics:
  scalars: 10
  fields: [5, 50, 15]
";
        let input = Configuration::from_string(text).unwrap();
        let scalars = TimeSelection::from_config(&input, "diagnostics", "scalars").unwrap();
        assert_eq!(scalars, TimeSelection::every(10));
        let fields = TimeSelection::from_config(&input, "diagnostics", "fields").unwrap();
        assert_eq!(fields, TimeSelection::new(5, 50, 15));
        let missing = TimeSelection::from_config(&input, "checkpoint", "dump_step").unwrap();
        assert!(missing.is_never());
    }
}
