use core::{marker::PhantomData, mem};

/// Not enough bytes left in the packet for the requested header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Truncated;

/// The packet bounds as seen by the xdp program: absolute start and end addresses.
pub trait Frame {
    fn data(&self) -> usize;
    fn data_end(&self) -> usize;
}

/// Returns a pointer to a `T` located at `offset` only if the whole `T` fits
/// inside the packet. The check must stay in this form so the verifier can
/// track the packet bounds.
#[inline(always)]
pub fn ptr_at<T, F: Frame>(frame: &F, offset: usize) -> Result<*mut T, Truncated> {
    let start = frame.data();
    let end = frame.data_end();
    let len = mem::size_of::<T>();

    if start + offset + len > end {
        return Err(Truncated);
    }

    Ok((start + offset) as *mut T)
}

/// Sequential header reader. Each read consumes a whole header or nothing.
#[derive(Debug, Default)]
pub struct Cursor {
    offset: usize,
}

impl Cursor {
    pub fn new() -> Self {
        Self { offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline(always)]
    pub fn read<T, F: Frame>(&mut self, frame: &F) -> Result<*mut T, Truncated> {
        let ptr = ptr_at::<T, F>(frame, self.offset)?;
        self.offset += mem::size_of::<T>();
        Ok(ptr)
    }
}

/// A frame backed by a byte slice, used outside the kernel.
pub struct SliceFrame<'a> {
    start: usize,
    end: usize,
    _buf: PhantomData<&'a mut [u8]>,
}

impl<'a> SliceFrame<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let start = buf.as_mut_ptr() as usize;
        Self {
            start,
            end: start + buf.len(),
            _buf: PhantomData,
        }
    }
}

impl Frame for SliceFrame<'_> {
    fn data(&self) -> usize {
        self.start
    }

    fn data_end(&self) -> usize {
        self.end
    }
}
