use crate::messages::Epoch;

/// Splits the inclusive range `[start, stop]` into consecutive epochs of
/// `size` blocks; the last one is truncated at `stop`. An empty range yields
/// nothing and a zero size is treated as one.
pub fn chunks(start: u64, stop: u64, size: u64) -> EpochChunks {
    EpochChunks {
        next: (start <= stop).then_some(start),
        stop,
        size: size.max(1),
    }
}

#[derive(Debug, Clone)]
pub struct EpochChunks {
    next: Option<u64>,
    stop: u64,
    size: u64,
}

impl Iterator for EpochChunks {
    type Item = Epoch;

    fn next(&mut self) -> Option<Epoch> {
        let begin = self.next?;
        let end = begin.saturating_add(self.size - 1).min(self.stop);
        self.next = if end >= self.stop { None } else { Some(end + 1) };
        Some(Epoch { begin, end })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.next {
            None => (0, Some(0)),
            Some(begin) => {
                let blocks = self.stop - begin + 1;
                let count = blocks.div_ceil(self.size);
                let count = usize::try_from(count).unwrap_or(usize::MAX);
                (count, Some(count))
            }
        }
    }
}
