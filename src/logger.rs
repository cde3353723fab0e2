use anyhow::Result;
use std::io::Write;

/// Tab-separated root-state-probability log, one row per sample. When the
/// engine has no root vector (e.g. the walk collapsed), the row carries
/// `0.0` for every state.
pub struct RootProbsLogger<W: Write> {
    out: W,
    num_states: usize,
}

impl<W: Write> RootProbsLogger<W> {
    pub fn new(mut out: W, num_states: usize) -> Result<Self> {
        write!(out, "Sample")?;
        for i in 0..num_states {
            write!(out, "\tstate{i}")?;
        }
        writeln!(out)?;
        Ok(Self { out, num_states })
    }

    pub fn log(&mut self, sample: u64, root_probs: Option<&[f64]>) -> Result<()> {
        write!(self.out, "{sample}")?;
        match root_probs {
            Some(p) => {
                for v in p.iter().take(self.num_states) {
                    write!(self.out, "\t{v}")?;
                }
            }
            None => {
                for _ in 0..self.num_states {
                    write!(self.out, "\t0.0")?;
                }
            }
        }
        writeln!(self.out)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
