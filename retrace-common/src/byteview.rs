//! A wrapper type providing uniform access to binary data.
//!
//! See the [`ByteView`] struct for more documentation.
//!
//! [`ByteView`]: struct.ByteView.html

use std::borrow::Cow;
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

/// The owner of data behind a ByteView.
///
/// This can either be an mmapped file, an owned buffer or a borrowed slice.
#[derive(Debug)]
enum ByteViewBacking<'a> {
    Buf(Cow<'a, [u8]>),
    Mmap(Mmap),
}

impl Deref for ByteViewBacking<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match *self {
            ByteViewBacking::Buf(ref buf) => buf,
            ByteViewBacking::Mmap(ref mmap) => mmap,
        }
    }
}

/// A smart pointer for byte data.
///
/// This type is used to uniformly pass bytes into the processing pipeline,
/// whether they were mapped in from a symbol file on disk, received from a
/// network fetch, or borrowed from a test fixture. A `ByteView` dereferences
/// into a `&[u8]` and is cheap to clone.
///
/// # Example
///
/// ```
/// use retrace_common::ByteView;
///
/// let view = ByteView::from_slice(b"MODULE Linux x86_64 4A90F locator");
/// assert!(view.starts_with(b"MODULE"));
/// ```
#[derive(Clone, Debug)]
pub struct ByteView<'a> {
    backing: Arc<ByteViewBacking<'a>>,
}

impl<'a> ByteView<'a> {
    fn with_backing(backing: ByteViewBacking<'a>) -> Self {
        ByteView {
            backing: Arc::new(backing),
        }
    }

    /// Constructs a `ByteView` from a `Cow`.
    pub fn from_cow(cow: Cow<'a, [u8]>) -> Self {
        ByteView::with_backing(ByteViewBacking::Buf(cow))
    }

    /// Constructs a `ByteView` from a byte slice.
    pub fn from_slice(buffer: &'a [u8]) -> Self {
        ByteView::from_cow(Cow::Borrowed(buffer))
    }

    /// Constructs a `ByteView` from a vector of bytes.
    pub fn from_vec(buffer: Vec<u8>) -> Self {
        ByteView::from_cow(Cow::Owned(buffer))
    }

    /// Constructs a `ByteView` from an open file handle by memory mapping the
    /// file.
    pub fn map_file(file: &File) -> Result<Self, io::Error> {
        let backing = match unsafe { Mmap::map(file) } {
            Ok(mmap) => ByteViewBacking::Mmap(mmap),
            Err(err) => {
                // Mapping an empty file fails on some platforms. Fall back to
                // an empty buffer since there is nothing to map anyway.
                if err.kind() == io::ErrorKind::InvalidInput {
                    ByteViewBacking::Buf(Cow::Borrowed(b""))
                } else {
                    return Err(err);
                }
            }
        };

        Ok(ByteView::with_backing(backing))
    }

    /// Constructs a `ByteView` from a file path by memory mapping the file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let file = File::open(path)?;
        Self::map_file(&file)
    }

    /// Returns a slice of the underlying data.
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        self.backing.deref()
    }
}

impl AsRef<[u8]> for ByteView<'_> {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Deref for ByteView<'_> {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use similar_asserts::assert_eq;

    #[test]
    fn test_from_vec_and_slice() {
        let vec_view = ByteView::from_vec(b"symbols".to_vec());
        let slice_view = ByteView::from_slice(b"symbols");
        assert_eq!(vec_view.as_slice(), slice_view.as_slice());
    }

    #[test]
    fn test_map_file() -> Result<(), io::Error> {
        let mut file = tempfile::tempfile()?;
        file.write_all(b"FUNC 1000 20 0 main")?;

        let view = ByteView::map_file(&file)?;
        assert_eq!(&*view, b"FUNC 1000 20 0 main");
        Ok(())
    }

    #[test]
    fn test_map_empty_file() -> Result<(), io::Error> {
        let file = tempfile::tempfile()?;
        let view = ByteView::map_file(&file)?;
        assert_eq!(&*view, b"");
        Ok(())
    }
}
