use std::fmt::{Display, Formatter};

/// Number of individual mismatch positions kept for reporting
pub const MAX_REPORTED_MISMATCHES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub position: usize,
    pub original: u8,
    pub received: u8,
}

impl Mismatch {
    fn divergence(&self) -> u8 {
        self.original.abs_diff(self.received)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyReport {
    pub original_len: usize,
    pub received_len: usize,
    /// number of differing bytes, only counted if both have the same length
    pub mismatch_count: usize,
    pub first_mismatches: Vec<Mismatch>,
    /// the mismatch with the biggest absolute byte difference, the first one if there are
    ///  several
    pub largest_divergence: Option<Mismatch>,
}

impl VerifyReport {
    pub fn matches(&self) -> bool {
        self.original_len == self.received_len && self.mismatch_count == 0
    }

    pub fn mismatch_percent(&self) -> f64 {
        if self.original_len == 0 {
            return 0.0;
        }
        self.mismatch_count as f64 * 100.0 / self.original_len as f64
    }
}

/// Compares received data to the original byte by byte. Data of different length is reported
///  as a size mismatch without comparing the content.
pub fn verify(original: &[u8], received: &[u8]) -> VerifyReport {
    let mut report = VerifyReport {
        original_len: original.len(),
        received_len: received.len(),
        mismatch_count: 0,
        first_mismatches: Vec::new(),
        largest_divergence: None,
    };
    if original.len() != received.len() {
        return report;
    }

    let mismatches = original.iter()
        .zip(received)
        .enumerate()
        .filter(|(_, (o, r))| o != r)
        .map(|(position, (&original, &received))| Mismatch { position, original, received });

    for mismatch in mismatches {
        report.mismatch_count += 1;
        if report.first_mismatches.len() < MAX_REPORTED_MISMATCHES {
            report.first_mismatches.push(mismatch);
        }
        match &report.largest_divergence {
            Some(largest) if largest.divergence() >= mismatch.divergence() => {}
            _ => report.largest_divergence = Some(mismatch),
        }
    }
    report
}

impl Display for VerifyReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.original_len != self.received_len {
            return write!(f, "Data size mismatch: original={} bytes, received={} bytes", self.original_len, self.received_len);
        }
        if self.matches() {
            return write!(f, "Data verification successful: all {} bytes match", self.original_len);
        }

        for m in &self.first_mismatches {
            writeln!(f, "Data mismatch at position {}: original=0x{:02x}, received=0x{:02x}", m.position, m.original, m.received)?;
        }
        if let Some(m) = &self.largest_divergence {
            writeln!(f, "Largest divergence at position {}: original=0x{:02x}, received=0x{:02x}", m.position, m.original, m.received)?;
        }
        write!(f, "Total data mismatches: {} bytes ({:.4}%)", self.mismatch_count, self.mismatch_percent())
    }
}
