/// Positioned iterator over an ordered collection. Unlike
/// `std::iter::Iterator`, positioning and access are separate so callers
/// can seek and then walk in either direction.
pub trait Iterator {
    fn is_valid(&self) -> bool;

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);

    /// Positions on the first entry at or after `key`.
    fn seek(&mut self, key: impl AsRef<[u8]>);

    fn next(&mut self);

    fn prev(&mut self);

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];
}
