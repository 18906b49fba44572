use crate::{Comm, Result};

/// The degenerate single-worker group: every collective is the identity.
/// This is what a run uses when multi-worker mode is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloComm;

impl Comm for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, words: &[u64]) -> Result<Vec<Vec<u64>>> {
        Ok(vec![words.to_vec()])
    }

    fn broadcast(&self, _root: usize, payload: Vec<u8>) -> Result<Vec<u8>> {
        Ok(payload)
    }

    fn abort(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_collectives() {
        let comm = SoloComm;
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        comm.barrier().unwrap();
        assert_eq!(comm.all_gather_u64(7).unwrap(), vec![7]);
        assert_eq!(comm.broadcast(0, vec![1, 2]).unwrap(), vec![1, 2]);
    }
}
