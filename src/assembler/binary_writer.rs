/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use crate::assembler::model::{AssemblyModel, Endianness, Storage};
use crate::errors::AssemblyError;

// Refuse to build absurdly sparse images rather than exhausting memory.
const MAX_IMAGE_BYTES: u64 = 256 * 1024 * 1024;

/// One storage's cells as output bytes, honouring cell width and endianness.
pub fn storage_bytes(storage: &Storage, endianness: Endianness) -> Vec<u8> {
    let width = storage.cell_width();
    let mut out = Vec::with_capacity(storage.data.len() * width);
    for &cell in &storage.data {
        match (width, endianness) {
            (1, _) => out.push(cell as u8),
            (2, Endianness::Little) => out.extend((cell as u16).to_le_bytes()),
            (2, Endianness::Big) => out.extend((cell as u16).to_be_bytes()),
            (4, Endianness::Little) => out.extend((cell as u32).to_le_bytes()),
            (4, Endianness::Big) => out.extend((cell as u32).to_be_bytes()),
            _ => unreachable!("cell width {}", width),
        }
    }
    out
}

/// Flat image covering [lowest, highest) over all storages, gaps zeroed.
/// Overlapping storages overwrite in source order.
pub fn write_binary(model: &AssemblyModel) -> Result<Vec<u8>, AssemblyError> {
    let ordered = model.storages_in_source_order();
    let occupied: Vec<&&Storage> = ordered.iter().filter(|s| s.length > 0).collect();
    if occupied.is_empty() {
        return Ok(Vec::new());
    }

    let lowest = occupied
        .iter()
        .map(|s| s.address as u32)
        .min()
        .unwrap_or(0);
    let highest = occupied
        .iter()
        .map(|s| s.address as u32 as u64 + s.length as u64)
        .max()
        .unwrap_or(0);
    let span = highest - lowest as u64;
    if span > MAX_IMAGE_BYTES {
        return Err(AssemblyError::Io {
            reason: format!(
                "binary image would span {} bytes ({:#010X}..{:#010X})",
                span, lowest, highest
            ),
        });
    }

    let mut image = vec![0u8; span as usize];
    for storage in ordered {
        if storage.length == 0 {
            continue;
        }
        let offset = (storage.address as u32 - lowest) as usize;
        let bytes = storage_bytes(storage, model.endianness);
        image[offset..offset + bytes.len()].copy_from_slice(&bytes);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CasePolicy, CellWidth, Expression, Line, SourceLocation};

    fn model_with_data(
        endianness: Endianness,
        entries: &[(i32, CellWidth, Vec<i32>)],
    ) -> AssemblyModel {
        let mut model = AssemblyModel::new(CasePolicy::Insensitive);
        let lines = (0..entries.len())
            .map(|i| Line::new(SourceLocation::new("test.asm", i as u32 + 1), ""))
            .collect();
        model.set_lines(lines);
        model.endianness = endianness;
        for (i, (address, width, cells)) in entries.iter().enumerate() {
            model.set_dollar(*address);
            let exprs = cells.iter().map(|&v| Expression::Number(v)).collect();
            model.upsert_data(i, *width, exprs).unwrap();
        }
        model
    }

    #[test]
    fn test_contiguous_bytes() {
        let model = model_with_data(
            Endianness::Big,
            &[(0x100, CellWidth::Byte, vec![1, 2, 3])],
        );
        assert_eq!(write_binary(&model).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_gap_zero_filled() {
        let model = model_with_data(
            Endianness::Big,
            &[
                (0x100, CellWidth::Byte, vec![0xAA]),
                (0x104, CellWidth::Byte, vec![0xBB]),
            ],
        );
        assert_eq!(
            write_binary(&model).unwrap(),
            vec![0xAA, 0, 0, 0, 0xBB]
        );
    }

    #[test]
    fn test_big_endian_dword() {
        let model = model_with_data(
            Endianness::Big,
            &[(0, CellWidth::DWord, vec![0x11223344])],
        );
        assert_eq!(
            write_binary(&model).unwrap(),
            vec![0x11, 0x22, 0x33, 0x44]
        );
    }

    #[test]
    fn test_little_endian_word() {
        let model = model_with_data(
            Endianness::Little,
            &[(0, CellWidth::Word, vec![0x1234])],
        );
        assert_eq!(write_binary(&model).unwrap(), vec![0x34, 0x12]);
    }

    #[test]
    fn test_overlap_last_write_wins() {
        let model = model_with_data(
            Endianness::Big,
            &[
                (0, CellWidth::Byte, vec![1, 2]),
                (0, CellWidth::Byte, vec![9]),
            ],
        );
        assert_eq!(write_binary(&model).unwrap(), vec![9, 2]);
    }

    #[test]
    fn test_empty_model_writes_nothing() {
        let model = AssemblyModel::new(CasePolicy::Insensitive);
        assert!(write_binary(&model).unwrap().is_empty());
    }

    #[test]
    fn test_storage_write_length_matches_cells() {
        let model = model_with_data(
            Endianness::Big,
            &[(0, CellWidth::Word, vec![1, 2, 3])],
        );
        let image = write_binary(&model).unwrap();
        assert_eq!(image.len(), 6);
    }
}
