use std::collections::BTreeMap;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;

use nix::errno::Errno;

use super::PageAlloc;
use super::round_down;
use super::round_up;

/// Longest io-vector handed to a single `vmsplice` call. The kernel caps
/// vectors at `IOV_MAX`; anything beyond is drained by looping.
const IOV_BATCH: usize = 1024;

/// Sparse, page-granular image of a file's plaintext.
///
/// Allocations are keyed by their page-aligned base offset; ranges are
/// pairwise disjoint and always page-multiple in length. The logical size is
/// tracked to the byte, and bytes below it that no allocation covers read as
/// zero.
#[derive(Debug)]
pub struct PageBuffer {
    chunks: BTreeMap<u64, PageAlloc>,
    size: u64,
    lock: bool,
}

impl PageBuffer {
    /// Creates an empty buffer. `lock` applies the per-allocation mlock
    /// policy to every region subsequently created.
    pub fn new(lock: bool) -> PageBuffer {
        PageBuffer {
            chunks: BTreeMap::new(),
            size: 0,
            lock,
        }
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copies `data` into the buffer at `offset`, materializing page-aligned
    /// regions for any part of the range not yet covered. The logical size
    /// grows to `offset + data.len()` when the write extends past it.
    ///
    /// A failed allocation (`ENOMEM`, including mlock quota exhaustion)
    /// leaves the buffer unchanged.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), Errno> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64;

        // Plan all regions the range needs before allocating any of them:
        // each uncovered gap gets a single region spanning from the
        // page-rounded start to the next allocation's base or the
        // page-rounded end of the write, whichever comes first.
        let mut needed: Vec<(u64, usize)> = Vec::new();
        let mut pos = offset;
        while pos < end {
            if let Some((base, chunk)) = self.chunks.range(..=pos).next_back() {
                let chunk_end = base + chunk.len() as u64;
                if chunk_end > pos {
                    pos = chunk_end;
                    continue;
                }
            }
            let start = round_down(pos);
            let cap = round_up(end);
            let stop = match self.chunks.range(pos..).next() {
                Some((next, _)) => cap.min(*next),
                None => cap,
            };
            needed.push((start, (stop - start) as usize));
            pos = stop;
        }
        let mut fresh = Vec::with_capacity(needed.len());
        for (start, len) in needed {
            fresh.push((start, PageAlloc::new(len, self.lock)?));
        }
        for (start, alloc) in fresh {
            self.chunks.insert(start, alloc);
        }

        let mut pos = offset;
        let mut src = data;
        while !src.is_empty() {
            let (base, chunk) = match self.chunks.range_mut(..=pos).next_back() {
                Some(entry) => entry,
                None => return Err(Errno::EIO),
            };
            let chunk_end = *base + chunk.len() as u64;
            debug_assert!(chunk_end > pos, "write range not covered at {pos}");
            if chunk_end <= pos {
                return Err(Errno::EIO);
            }
            let skip = (pos - *base) as usize;
            let n = src.len().min((chunk_end - pos) as usize);
            chunk.as_mut_slice()[skip..skip + n].copy_from_slice(&src[..n]);
            pos += n as u64;
            src = &src[n..];
        }
        self.size = self.size.max(end);
        Ok(())
    }

    /// Copies up to `out.len()` bytes starting at `offset` into `out`,
    /// zero-filling holes, and returns the number of bytes delivered. The
    /// request is clamped to the logical size; bytes of `out` past the
    /// returned count are left untouched.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> usize {
        if offset >= self.size {
            return 0;
        }
        let n = (out.len() as u64).min(self.size - offset) as usize;
        let end = offset + n as u64;
        let mut pos = offset;
        let mut filled = 0usize;
        for (base, chunk) in self.chunks.range(..end) {
            let chunk_end = *base + chunk.len() as u64;
            if chunk_end <= pos {
                continue;
            }
            let hole = ((*base).max(pos) - pos) as usize;
            out[filled..filled + hole].fill(0);
            filled += hole;
            pos += hole as u64;

            let skip = (pos - *base) as usize;
            let take = (chunk_end.min(end) - pos) as usize;
            out[filled..filled + take].copy_from_slice(&chunk.as_slice()[skip..skip + take]);
            filled += take;
            pos += take as u64;
            if pos >= end {
                break;
            }
        }
        out[filled..n].fill(0);
        n
    }

    /// Sets the logical size to `n`. Shrinking drops every allocation based
    /// at or beyond `n`; an allocation straddling `n` is kept whole, its
    /// tail merely becoming invisible.
    pub fn resize(&mut self, n: u64) {
        if n < self.size {
            self.chunks.retain(|base, _| *base < n);
        }
        self.size = n;
    }

    /// Drops every allocation and resets the logical size to zero.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }

    /// Transfers the entire logical content into `fd`, which must be the
    /// write end of a pipe.
    ///
    /// The whole-page prefix goes through `vmsplice` as one gather vector,
    /// with holes represented by a single reusable zeroed page, resuming
    /// from partially consumed entries as the kernel drains them. The
    /// sub-page tail is sent with an ordinary `write`. Returns the total
    /// number of bytes transferred.
    pub fn splice(&self, fd: BorrowedFd<'_>) -> Result<u64, Errno> {
        let page = super::page_size();
        let whole = round_down(self.size);
        let scratch = if whole > 0 {
            Some(PageAlloc::new(page as usize, false)?)
        } else {
            None
        };

        let mut iovs: Vec<libc::iovec> = Vec::new();
        let mut pos = 0u64;
        for (base, chunk) in self.chunks.range(..whole) {
            let chunk_end = (*base + chunk.len() as u64).min(whole);
            if let Some(zero) = &scratch {
                while pos < *base {
                    let len = (*base - pos).min(page) as usize;
                    iovs.push(libc::iovec {
                        iov_base: zero.as_ptr().cast(),
                        iov_len: len,
                    });
                    pos += len as u64;
                }
            }
            iovs.push(libc::iovec {
                iov_base: chunk.as_ptr().cast(),
                iov_len: (chunk_end - *base) as usize,
            });
            pos = chunk_end;
        }
        if let Some(zero) = &scratch {
            while pos < whole {
                let len = (whole - pos).min(page) as usize;
                iovs.push(libc::iovec {
                    iov_base: zero.as_ptr().cast(),
                    iov_len: len,
                });
                pos += len as u64;
            }
        }

        let mut total = 0u64;
        let mut index = 0usize;
        // Bytes of iovs[index] already consumed by a previous call.
        let mut consumed = 0usize;
        while index < iovs.len() {
            let batch_end = iovs.len().min(index + IOV_BATCH);
            let mut batch = iovs[index..batch_end].to_vec();
            batch[0].iov_base = unsafe { batch[0].iov_base.cast::<u8>().add(consumed).cast() };
            batch[0].iov_len -= consumed;
            let n = unsafe { libc::vmsplice(fd.as_raw_fd(), batch.as_ptr(), batch.len(), 0) };
            if n < 0 {
                let err = Errno::last();
                if err == Errno::EINTR {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                return Err(Errno::EIO);
            }
            total += n as u64;
            let mut drained = n as usize + consumed;
            while index < iovs.len() && drained >= iovs[index].iov_len {
                drained -= iovs[index].iov_len;
                index += 1;
            }
            consumed = drained;
        }

        let tail = (self.size - whole) as usize;
        if tail > 0 {
            let mut buf = vec![0u8; tail];
            self.read(whole, &mut buf);
            write_all(fd, &buf)?;
            total += tail as u64;
        }
        Ok(total)
    }

    #[cfg(test)]
    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

fn write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> Result<(), Errno> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = Errno::last();
            if err == Errno::EINTR {
                continue;
            }
            return Err(err);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::os::fd::AsFd;
    use std::os::fd::FromRawFd;

    use super::*;

    fn page() -> u64 {
        super::super::page_size()
    }

    fn pipe() -> (File, File) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut buffer = PageBuffer::new(false);
        buffer.write(0, b"abcdefg").unwrap();
        assert_eq!(buffer.size(), 7);

        let mut out = [0u8; 64];
        let n = buffer.read(0, &mut out);
        assert_eq!(n, 7);
        assert_eq!(&out[..7], b"abcdefg");
    }

    #[test]
    fn holes_read_zero() {
        let mut buffer = PageBuffer::new(false);
        let far = 3 * page() + 5;
        buffer.write(0, b"head").unwrap();
        buffer.write(far, b"tail").unwrap();
        assert_eq!(buffer.size(), far + 4);

        let mut out = vec![0xffu8; buffer.size() as usize];
        let n = buffer.read(0, &mut out);
        assert_eq!(n as u64, far + 4);
        assert_eq!(&out[..4], b"head");
        assert!(out[4..far as usize].iter().all(|b| *b == 0));
        assert_eq!(&out[far as usize..], b"tail");
    }

    #[test]
    fn read_past_size_returns_zero_and_leaves_output_alone() {
        let mut buffer = PageBuffer::new(false);
        buffer.write(0, b"xyz").unwrap();

        let mut out = [0xaau8; 8];
        assert_eq!(buffer.read(100, &mut out), 0);
        assert!(out.iter().all(|b| *b == 0xaa));

        let n = buffer.read(1, &mut out);
        assert_eq!(n, 2);
        assert_eq!(&out[..2], b"yz");
        assert!(out[2..].iter().all(|b| *b == 0xaa));
    }

    #[test]
    fn zero_length_write_changes_nothing() {
        let mut buffer = PageBuffer::new(false);
        buffer.write(1234, b"").unwrap();
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.chunk_count(), 0);
    }

    #[test]
    fn write_continues_across_allocations() {
        let mut buffer = PageBuffer::new(false);
        let boundary = page();
        buffer.write(boundary, b"second").unwrap();
        assert_eq!(buffer.chunk_count(), 1);

        // Starts inside nothing, runs into the existing allocation.
        let data = vec![0x5a; 32];
        buffer.write(boundary - 16, &data).unwrap();
        assert_eq!(buffer.chunk_count(), 2);

        let mut out = vec![0u8; 32];
        assert_eq!(buffer.read(boundary - 16, &mut out), 32);
        assert_eq!(&out[..16], &data[..16]);
        // The second half of the write overwrote the start of "second".
        assert_eq!(&out[16..], &data[16..]);
    }

    #[test]
    fn gap_fill_creates_a_single_allocation() {
        let mut buffer = PageBuffer::new(false);
        buffer.write(0, b"a").unwrap();
        buffer.write(3 * page(), b"b").unwrap();
        assert_eq!(buffer.chunk_count(), 2);

        // Covers the tail of the first allocation, the whole gap, and the
        // head of the second: exactly one new allocation spans the gap.
        let span = vec![0x11u8; (2 * page() + 20) as usize];
        buffer.write(page() - 10, &span).unwrap();
        assert_eq!(buffer.chunk_count(), 3);

        let mut out = vec![0u8; span.len()];
        assert_eq!(buffer.read(page() - 10, &mut out), span.len());
        assert_eq!(out, span);
    }

    #[test]
    fn resize_keeps_straddling_allocation() {
        let mut buffer = PageBuffer::new(false);
        let len = (page() + 10) as usize;
        buffer.write(0, &vec![0x7fu8; len]).unwrap();
        assert_eq!(buffer.chunk_count(), 1);

        buffer.resize(5);
        assert_eq!(buffer.size(), 5);
        assert_eq!(buffer.chunk_count(), 1);

        let mut out = [0u8; 16];
        assert_eq!(buffer.read(0, &mut out), 5);
        assert_eq!(&out[..5], &[0x7f; 5]);

        buffer.resize(0);
        assert_eq!(buffer.chunk_count(), 0);
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn resize_drops_allocations_past_the_cut() {
        let mut buffer = PageBuffer::new(false);
        buffer.write(0, b"a").unwrap();
        buffer.write(4 * page(), b"b").unwrap();
        assert_eq!(buffer.chunk_count(), 2);

        buffer.resize(page());
        assert_eq!(buffer.chunk_count(), 1);
        assert_eq!(buffer.size(), page());

        // Growing again leaves a hole that reads as zero.
        buffer.resize(2 * page());
        let mut out = vec![0xffu8; (2 * page()) as usize];
        assert_eq!(buffer.read(0, &mut out), out.len());
        assert_eq!(out[0], b'a');
        assert!(out[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn latest_write_wins() {
        let mut buffer = PageBuffer::new(false);
        buffer.write(0, &vec![b'a'; 100]).unwrap();
        buffer.write(50, &vec![b'b'; 100]).unwrap();
        buffer.write(75, b"c").unwrap();

        let mut out = [0u8; 150];
        assert_eq!(buffer.read(0, &mut out), 150);
        assert!(out[..50].iter().all(|b| *b == b'a'));
        assert!(out[50..75].iter().all(|b| *b == b'b'));
        assert_eq!(out[75], b'c');
        assert!(out[76..150].iter().all(|b| *b == b'b'));
    }

    #[test]
    fn splice_across_gap() {
        let mut buffer = PageBuffer::new(false);
        let data = vec![0xabu8; 128];
        buffer.write(0, &data).unwrap();
        buffer.write(8192 + 128, &data).unwrap();

        let (mut read_end, write_end) = pipe();
        let reader = std::thread::spawn(move || {
            let mut drained = Vec::new();
            read_end.read_to_end(&mut drained).unwrap();
            drained
        });
        let sent = buffer.splice(write_end.as_fd()).unwrap();
        drop(write_end);
        assert_eq!(sent, buffer.size());

        let drained = reader.join().unwrap();
        assert_eq!(drained.len() as u64, buffer.size());
        assert_eq!(&drained[..128], &data[..]);
        assert!(drained[128..8192 + 128].iter().all(|b| *b == 0));
        assert_eq!(&drained[8192 + 128..], &data[..]);
    }

    #[test]
    fn splice_matches_read() {
        let mut buffer = PageBuffer::new(false);
        buffer.write(10, b"near the front").unwrap();
        buffer.write(2 * page() + 100, b"after a hole").unwrap();
        buffer.write(3 * page() - 3, b"straddles a page boundary").unwrap();

        let mut expected = vec![0u8; buffer.size() as usize];
        assert_eq!(buffer.read(0, &mut expected), expected.len());

        let (mut read_end, write_end) = pipe();
        let reader = std::thread::spawn(move || {
            let mut drained = Vec::new();
            read_end.read_to_end(&mut drained).unwrap();
            drained
        });
        let sent = buffer.splice(write_end.as_fd()).unwrap();
        drop(write_end);
        assert_eq!(sent, buffer.size());
        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn splice_empty_buffer_sends_nothing() {
        let buffer = PageBuffer::new(false);
        let (mut read_end, write_end) = pipe();
        assert_eq!(buffer.splice(write_end.as_fd()).unwrap(), 0);
        drop(write_end);

        let mut drained = Vec::new();
        read_end.read_to_end(&mut drained).unwrap();
        assert!(drained.is_empty());
    }
}
