use btrfuzz_channel::{cov, MAP_SIZE};

/// Highest hit count seen per edge slot by one worker.
pub struct Feedback {
    max_cov: Box<[u8]>,
    edges: usize,
}

impl Default for Feedback {
    fn default() -> Self {
        Self {
            max_cov: vec![0; MAP_SIZE].into_boxed_slice(),
            edges: 0,
        }
    }
}

impl Feedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one coverage record, returning how many edges it hit for the first time.
    pub fn check_max_cov(&mut self, record: &[u8]) -> usize {
        let n = cov::merge_new_edges(&mut self.max_cov, record);
        self.edges += n;
        n
    }

    pub fn max_cov_len(&self) -> usize {
        self.edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_edges_only_once() {
        let mut fb = Feedback::new();
        let mut rec = vec![0; MAP_SIZE];
        rec[3] = 1;
        rec[9] = 2;
        assert_eq!(fb.check_max_cov(&rec), 2);
        assert_eq!(fb.check_max_cov(&rec), 0);
        rec[10] = 1;
        assert_eq!(fb.check_max_cov(&rec), 1);
        assert_eq!(fb.max_cov_len(), 3);
    }
}
