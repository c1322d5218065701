use serde::{Deserialize, Serialize};

pub const MIN_VALID_TEMP_C: f32 = -20.0;
pub const MAX_VALID_TEMP_C: f32 = 60.0;

/// Brewing phase the device is regulating for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Program {
    #[default]
    Fermentation,
    Maturation,
    Priming,
}

impl Program {
    pub const ALL: [Program; 3] = [Self::Fermentation, Self::Maturation, Self::Priming];

    /// Single byte stored in the program file.
    pub fn flag(self) -> u8 {
        match self {
            Self::Fermentation => b'F',
            Self::Maturation => b'M',
            Self::Priming => b'P',
        }
    }

    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            b'F' => Some(Self::Fermentation),
            b'M' => Some(Self::Maturation),
            b'P' => Some(Self::Priming),
            _ => None,
        }
    }

    /// Only the first byte of a message selects the program, so both `F` and
    /// `Fermentation` work.
    pub fn from_message(message: &[u8]) -> Option<Self> {
        message.first().copied().and_then(Self::from_flag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fermentation => "FERMENTATION",
            Self::Maturation => "MATURATION",
            Self::Priming => "PRIMING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(rename = "minC")]
    pub min_c: f32,
    #[serde(rename = "maxC")]
    pub max_c: f32,
}

impl Thresholds {
    pub const fn new(min_c: f32, max_c: f32) -> Self {
        Self { min_c, max_c }
    }

    pub fn midpoint(&self) -> f32 {
        (self.min_c + self.max_c) / 2.0
    }

    pub fn validate(&self) -> bool {
        self.min_c.is_finite()
            && self.max_c.is_finite()
            && self.min_c <= self.max_c
            && (MIN_VALID_TEMP_C..=MAX_VALID_TEMP_C).contains(&self.min_c)
            && (MIN_VALID_TEMP_C..=MAX_VALID_TEMP_C).contains(&self.max_c)
    }

    fn sanitize(&mut self, fallback: Thresholds) {
        if !self.min_c.is_finite() || !self.max_c.is_finite() {
            *self = fallback;
            return;
        }
        if self.min_c > self.max_c {
            std::mem::swap(&mut self.min_c, &mut self.max_c);
        }
        self.min_c = self.min_c.clamp(MIN_VALID_TEMP_C, MAX_VALID_TEMP_C);
        self.max_c = self.max_c.clamp(MIN_VALID_TEMP_C, MAX_VALID_TEMP_C);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramTable {
    pub fermentation: Thresholds,
    pub maturation: Thresholds,
    pub priming: Thresholds,
}

impl Default for ProgramTable {
    fn default() -> Self {
        Self {
            fermentation: Thresholds::new(19.0, 22.0),
            maturation: Thresholds::new(1.0, 2.0),
            priming: Thresholds::new(20.0, 22.0),
        }
    }
}

impl ProgramTable {
    pub fn thresholds(&self, program: Program) -> Thresholds {
        match program {
            Program::Fermentation => self.fermentation,
            Program::Maturation => self.maturation,
            Program::Priming => self.priming,
        }
    }

    pub fn validate(&self) -> bool {
        Program::ALL
            .iter()
            .all(|program| self.thresholds(*program).validate())
    }

    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        self.fermentation.sanitize(defaults.fermentation);
        self.maturation.sanitize(defaults.maturation);
        self.priming.sanitize(defaults.priming);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bytes_map_to_programs() {
        for program in Program::ALL {
            assert_eq!(Program::from_flag(program.flag()), Some(program));
        }
        assert_eq!(Program::from_flag(b'f'), None);
        assert_eq!(Program::from_flag(b'X'), None);
    }

    #[test]
    fn message_uses_first_byte_only() {
        assert_eq!(
            Program::from_message(b"Maturation"),
            Some(Program::Maturation)
        );
        assert_eq!(Program::from_message(b"P"), Some(Program::Priming));
        assert_eq!(Program::from_message(b""), None);
        assert_eq!(Program::from_message(b"priming"), None);
    }

    #[test]
    fn default_table_matches_brewing_phases() {
        let table = ProgramTable::default();

        assert_eq!(table.thresholds(Program::Fermentation), Thresholds::new(19.0, 22.0));
        assert_eq!(table.thresholds(Program::Maturation), Thresholds::new(1.0, 2.0));
        assert_eq!(table.thresholds(Program::Priming), Thresholds::new(20.0, 22.0));
        assert!(table.validate());
    }

    #[test]
    fn sanitize_swaps_and_clamps() {
        let mut table = ProgramTable {
            fermentation: Thresholds::new(24.0, 18.0),
            maturation: Thresholds::new(-80.0, 2.0),
            priming: Thresholds::new(f32::NAN, 22.0),
        };
        table.sanitize();

        assert_eq!(table.fermentation, Thresholds::new(18.0, 24.0));
        assert_eq!(table.maturation, Thresholds::new(MIN_VALID_TEMP_C, 2.0));
        assert_eq!(table.priming, ProgramTable::default().priming);
        assert!(table.validate());
    }
}
