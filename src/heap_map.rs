//! Heap-map rendering: one ASCII character per basic block (spec.md §6).
//!
//! In this implementation every basic block lives at increasing addresses
//! from `heap_low` (see `page_source` module docs), so the map always reads
//! low-to-high; spec.md §9's open question about growth direction is
//! resolved for this engine by construction, and noted in `DESIGN.md`.

use crate::directory::BlockDirectory;

/// Render one character per basic block, in position order.
pub fn render(directory: &BlockDirectory) -> String {
    directory
        .iter()
        .map(|(_, descriptor)| descriptor.role_char())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Payload;
    use crate::page_source::PageSource;

    #[test]
    fn renders_one_character_per_block_in_position_order() {
        let mut directory = BlockDirectory::new(4096, 64);
        let mut source = PageSource::new(4096);
        let (start, _) = directory.allocate_descriptors(&mut source, 3).unwrap();
        directory.descriptor_mut(start).payload = Payload::StartOfUser {
            size: 10,
            caller: crate::caller::CallerKey::Unknown,
            overhead: crate::block::OverheadRecord::default(),
        };

        let map = render(&directory);
        assert_eq!(map.chars().count(), 3);
        assert_eq!(map.chars().next(), Some('S'));
    }
}
