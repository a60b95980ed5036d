//! Tuning configurations and compile option assembly.

use convforge_backend_gpu::ExecutionContext;
use convforge_problem::ProblemDescriptor;
use std::fmt;

/// Solver-specific tuning tokens as stored in the performance database,
/// e.g. `16.16.8.8.2.4.1.1.4`. Empty for solvers without tunables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TuningConfig(String);

impl TuningConfig {
    pub fn new(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TuningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TuningConfig {
    fn from(blob: String) -> Self {
        Self(blob)
    }
}

/// Typed view of a solver's tuning tokens.
pub trait PerformanceConfig: Sized + Clone + PartialEq + fmt::Debug {
    /// `None` when the token count or any token is wrong.
    fn parse(blob: &str) -> Option<Self>;

    fn serialize(&self) -> String;

    fn is_valid(&self, problem: &ProblemDescriptor) -> bool;

    fn to_tuning(&self) -> TuningConfig {
        TuningConfig::new(self.serialize())
    }

    /// Parses and validates in one step; failures mean "no usable config".
    fn from_tuning(config: &TuningConfig, problem: &ProblemDescriptor) -> Option<Self> {
        Self::parse(config.as_str()).filter(|parsed| parsed.is_valid(problem))
    }
}

fn parse_tokens<const N: usize>(blob: &str) -> Option<[usize; N]> {
    let mut out = [0usize; N];
    let mut tokens = blob.split('.');
    for slot in out.iter_mut() {
        *slot = tokens.next()?.parse().ok()?;
    }
    match tokens.next() {
        Some(_) => None,
        None => Some(out),
    }
}

fn join_tokens(tokens: &[usize]) -> String {
    tokens.iter().map(usize::to_string).collect::<Vec<_>>().join(".")
}

/// Nine-token record used by the generic direct convolution kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LegacyPerformanceConfig {
    pub grp_tile1: usize,
    pub grp_tile0: usize,
    pub in_tile1: usize,
    pub in_tile0: usize,
    pub out_pix_tile1: usize,
    pub out_pix_tile0: usize,
    pub n_out_pix_tiles: usize,
    pub n_in_data_tiles: usize,
    pub n_stacks: usize,
}

impl LegacyPerformanceConfig {
    const GROUP_TILES: [usize; 2] = [8, 16];
    const IN_TILES: [usize; 4] = [8, 16, 32, 64];
    const OUT_PIX_TILES: [usize; 3] = [1, 2, 4];
    const N_OUT_PIX_TILES: [usize; 4] = [1, 2, 4, 8];
    const N_IN_DATA_TILES: [usize; 3] = [1, 2, 4];
    const N_STACKS: [usize; 3] = [1, 2, 4];

    /// Heuristic starting point sized to the output plane.
    pub fn heuristic(problem: &ProblemDescriptor) -> Self {
        let small = problem.out_width <= 8 || problem.out_height <= 8;
        let in_tile = if small { 8 } else { 16 };
        let out_pix = if small { 1 } else { 2 };
        let n_out_pix_tiles = if problem.n_outputs % 8 == 0 {
            8
        } else if problem.n_outputs % 4 == 0 {
            4
        } else {
            1
        };
        let n_in_data_tiles = if problem.n_inputs % 2 == 0 { 2 } else { 1 };
        Self {
            grp_tile1: 16,
            grp_tile0: 16,
            in_tile1: in_tile,
            in_tile0: in_tile,
            out_pix_tile1: out_pix,
            out_pix_tile0: out_pix,
            n_out_pix_tiles,
            n_in_data_tiles,
            n_stacks: 1,
        }
    }

    /// Every valid configuration, in a fixed order.
    pub fn search_space(problem: &ProblemDescriptor) -> Vec<Self> {
        let mut space = Vec::new();
        for grp in Self::GROUP_TILES {
            for in_tile in [8, 16, 32] {
                for out_pix in Self::OUT_PIX_TILES {
                    for n_out_pix_tiles in [1, 4, 8] {
                        for n_in_data_tiles in [1, 2] {
                            for n_stacks in [1, 2] {
                                let candidate = Self {
                                    grp_tile1: grp,
                                    grp_tile0: grp,
                                    in_tile1: in_tile,
                                    in_tile0: in_tile,
                                    out_pix_tile1: out_pix,
                                    out_pix_tile0: out_pix,
                                    n_out_pix_tiles,
                                    n_in_data_tiles,
                                    n_stacks,
                                };
                                if candidate.is_valid(problem) {
                                    space.push(candidate);
                                }
                            }
                        }
                    }
                }
            }
        }
        space
    }
}

impl PerformanceConfig for LegacyPerformanceConfig {
    fn parse(blob: &str) -> Option<Self> {
        let [grp_tile1, grp_tile0, in_tile1, in_tile0, out_pix_tile1, out_pix_tile0, n_out_pix_tiles, n_in_data_tiles, n_stacks] =
            parse_tokens::<9>(blob)?;
        Some(Self {
            grp_tile1,
            grp_tile0,
            in_tile1,
            in_tile0,
            out_pix_tile1,
            out_pix_tile0,
            n_out_pix_tiles,
            n_in_data_tiles,
            n_stacks,
        })
    }

    fn serialize(&self) -> String {
        join_tokens(&[
            self.grp_tile1,
            self.grp_tile0,
            self.in_tile1,
            self.in_tile0,
            self.out_pix_tile1,
            self.out_pix_tile0,
            self.n_out_pix_tiles,
            self.n_in_data_tiles,
            self.n_stacks,
        ])
    }

    fn is_valid(&self, problem: &ProblemDescriptor) -> bool {
        Self::GROUP_TILES.contains(&self.grp_tile0)
            && Self::GROUP_TILES.contains(&self.grp_tile1)
            && Self::IN_TILES.contains(&self.in_tile0)
            && Self::IN_TILES.contains(&self.in_tile1)
            && Self::OUT_PIX_TILES.contains(&self.out_pix_tile0)
            && Self::OUT_PIX_TILES.contains(&self.out_pix_tile1)
            && Self::N_OUT_PIX_TILES.contains(&self.n_out_pix_tiles)
            && Self::N_IN_DATA_TILES.contains(&self.n_in_data_tiles)
            && Self::N_STACKS.contains(&self.n_stacks)
            && self.out_pix_tile0 <= self.in_tile0
            && self.out_pix_tile1 <= self.in_tile1
            && self.n_stacks <= problem.batch
    }
}

/// `limit_wave_cnt.filters_per_wave.output_lines_per_wave` for the 3x3
/// assembly kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Asm3x3PerformanceConfig {
    pub limit_wave_cnt: usize,
    pub filters_per_wave: usize,
    pub output_lines_per_wave: usize,
}

impl Asm3x3PerformanceConfig {
    pub fn heuristic(problem: &ProblemDescriptor) -> Self {
        let filters_per_wave = [4, 2, 1]
            .into_iter()
            .find(|f| problem.n_outputs % f == 0)
            .unwrap_or(1);
        let output_lines_per_wave = if problem.out_height >= 32 { 2 } else { 1 };
        Self {
            limit_wave_cnt: 0,
            filters_per_wave,
            output_lines_per_wave,
        }
    }

    pub fn search_space(problem: &ProblemDescriptor) -> Vec<Self> {
        let mut space = Vec::new();
        for limit_wave_cnt in [0, 2, 5, 10] {
            for filters_per_wave in [1, 2, 4, 8] {
                for output_lines_per_wave in [1, 2, 4, 8] {
                    let candidate = Self {
                        limit_wave_cnt,
                        filters_per_wave,
                        output_lines_per_wave,
                    };
                    if candidate.is_valid(problem) {
                        space.push(candidate);
                    }
                }
            }
        }
        space
    }
}

impl PerformanceConfig for Asm3x3PerformanceConfig {
    fn parse(blob: &str) -> Option<Self> {
        let [limit_wave_cnt, filters_per_wave, output_lines_per_wave] = parse_tokens::<3>(blob)?;
        Some(Self {
            limit_wave_cnt,
            filters_per_wave,
            output_lines_per_wave,
        })
    }

    fn serialize(&self) -> String {
        join_tokens(&[self.limit_wave_cnt, self.filters_per_wave, self.output_lines_per_wave])
    }

    fn is_valid(&self, problem: &ProblemDescriptor) -> bool {
        self.limit_wave_cnt <= 10
            && (1..=8).contains(&self.filters_per_wave)
            && (1..=8).contains(&self.output_lines_per_wave)
            && problem.n_outputs % self.filters_per_wave == 0
            && self.output_lines_per_wave <= problem.out_height.max(1)
    }
}

/// Accumulates `-DNAME=VALUE` defines after the context's general options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions(String);

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_context(ctx: &ExecutionContext) -> Self {
        Self(ctx.general_compile_options().to_string())
    }

    pub fn define(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.0.push_str(&format!(" -D{name}={value}"));
        self
    }

    pub fn flag(self, name: &str, enabled: bool) -> Self {
        self.define(name, u8::from(enabled))
    }

    pub fn build(self) -> String {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convforge_problem::Direction;

    fn problem() -> ProblemDescriptor {
        ProblemDescriptor::new(Direction::Forward)
            .with_input(64, 8, 8)
            .with_kernel(5, 5)
            .with_output(32, 8, 8)
            .with_batch(100)
    }

    #[test]
    fn legacy_record_uses_documented_order() {
        let config = LegacyPerformanceConfig::parse("16.16.8.8.2.4.1.1.4").unwrap();
        assert_eq!(config.grp_tile1, 16);
        assert_eq!(config.in_tile0, 8);
        assert_eq!(config.out_pix_tile1, 2);
        assert_eq!(config.out_pix_tile0, 4);
        assert_eq!(config.n_stacks, 4);
        assert_eq!(config.serialize(), "16.16.8.8.2.4.1.1.4");
        assert!(config.is_valid(&problem()));
    }

    #[test]
    fn malformed_blobs_do_not_parse() {
        assert!(LegacyPerformanceConfig::parse("16.16.8.8.2.4.1.1").is_none());
        assert!(LegacyPerformanceConfig::parse("16.16.8.8.2.4.1.1.4.4").is_none());
        assert!(LegacyPerformanceConfig::parse("16.16.x.8.2.4.1.1.4").is_none());
        assert!(Asm3x3PerformanceConfig::parse("0.2").is_none());
        assert!(Asm3x3PerformanceConfig::parse("16.16.8.8.2.4.1.1.4").is_none());
    }

    #[test]
    fn invalid_records_are_rejected_for_the_problem() {
        let tiny_batch = problem().with_batch(2);
        let config = TuningConfig::new("16.16.8.8.2.4.1.1.4");
        assert!(LegacyPerformanceConfig::from_tuning(&config, &problem()).is_some());
        assert!(LegacyPerformanceConfig::from_tuning(&config, &tiny_batch).is_none());
        assert!(LegacyPerformanceConfig::from_tuning(&TuningConfig::new("12.16.8.8.2.4.1.1.1"), &problem()).is_none());
    }

    #[test]
    fn heuristics_are_valid_and_in_search_space() {
        let p = problem();
        let legacy = LegacyPerformanceConfig::heuristic(&p);
        assert!(legacy.is_valid(&p));
        assert!(LegacyPerformanceConfig::search_space(&p).iter().all(|c| c.is_valid(&p)));

        let asm = Asm3x3PerformanceConfig::heuristic(&p);
        assert!(asm.is_valid(&p));
        assert_eq!(Asm3x3PerformanceConfig::parse(&asm.serialize()), Some(asm));
        assert!(!Asm3x3PerformanceConfig::search_space(&p).is_empty());
    }

    #[test]
    fn compile_options_append_defines() {
        let options = CompileOptions::new().define("TILE", 16).flag("BIAS", true).build();
        assert_eq!(options, " -DTILE=16 -DBIAS=1");
    }
}
