//! The dyld shared cache container.
//!
//! Opens the main cache file plus any sibling sub-caches (`.1…N` or
//! named suffixes, and the `.symbols` file) and maintains one unified
//! list of vmaddr mappings across all of them. Every file is mapped
//! copy-on-write so converters can rewrite bytes in memory while the
//! files on disk stay untouched.

pub mod structs;

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use scroll::ctx::{TryFromCtx, TryIntoCtx};
use scroll::{Pread, Pwrite};

use crate::error::{ExtractError, Result};
use structs::{
    DyldCacheHeader, ImageInfo, MappingAndSlideInfo, MappingInfo, SubCacheEntryV1, SubCacheEntryV2,
    header_field,
};

/// One mapped cache file: the main cache or one of its siblings.
pub struct CacheFile {
    pub path: PathBuf,
    pub header: DyldCacheHeader,
    map: MmapMut,
}

impl CacheFile {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // A private copy-on-write view; converter writes never reach disk.
        let map = unsafe { MmapOptions::new().map_copy(&file)? };

        let mut header_bytes = [0u8; DyldCacheHeader::SIZE];
        let prefix = DyldCacheHeader::SIZE.min(map.len());
        header_bytes[..prefix].copy_from_slice(&map[..prefix]);

        let header: DyldCacheHeader = header_bytes.pread_with(0, scroll::LE)?;
        if &header.magic[..4] != b"dyld" {
            return Err(ExtractError::ContainerParse(format!(
                "{} does not start with a dyld cache magic",
                path.display()
            )));
        }

        Ok(CacheFile {
            path: path.to_owned(),
            header,
            map,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.map
    }
}

/// A cache mapping tagged with the file that backs it.
#[derive(Debug, Clone, Copy)]
pub struct CacheMapping {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub file_index: usize,
    pub slide_info_file_offset: u64,
    pub slide_info_file_size: u64,
}

impl CacheMapping {
    pub fn contains_addr(&self, vmaddr: u64) -> bool {
        vmaddr >= self.address && vmaddr < self.address + self.size
    }
}

pub struct DyldCache {
    pub files: Vec<CacheFile>,
    pub mappings: Vec<CacheMapping>,
    pub images: Vec<ImageInfo>,
}

impl DyldCache {
    /// Opens the main cache file and all of its siblings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let main = CacheFile::open(path)?;

        let mut cache = DyldCache {
            files: Vec::new(),
            mappings: Vec::new(),
            images: Vec::new(),
        };
        cache.add_file(main);
        cache.read_images()?;
        cache.add_sub_caches(path)?;

        Ok(cache)
    }

    /// Re-opens the same cache as a fresh copy-on-write instance. Used
    /// by batch drivers to give every worker its own mutable view.
    pub fn reopen(&self) -> Result<Self> {
        DyldCache::open(&self.files[0].path)
    }

    pub fn header(&self) -> &DyldCacheHeader {
        &self.files[0].header
    }

    fn add_file(&mut self, file: CacheFile) {
        let file_index = self.files.len();

        let mapping_offset = file.header.mapping_offset as usize;
        let with_slide = file
            .header
            .contains_field(header_field::MAPPING_WITH_SLIDE_OFFSET)
            && file.header.mapping_with_slide_count != 0;

        for i in 0..file.header.mapping_count as usize {
            let mapping = if with_slide && i < file.header.mapping_with_slide_count as usize {
                let offset = file.header.mapping_with_slide_offset as usize
                    + i * MappingAndSlideInfo::SIZE;
                let info: MappingAndSlideInfo = match file.data().pread_with(offset, scroll::LE) {
                    Ok(info) => info,
                    Err(_) => continue,
                };
                CacheMapping {
                    address: info.address,
                    size: info.size,
                    file_offset: info.file_offset,
                    file_index,
                    slide_info_file_offset: info.slide_info_file_offset,
                    slide_info_file_size: info.slide_info_file_size,
                }
            } else {
                let offset = mapping_offset + i * MappingInfo::SIZE;
                let info: MappingInfo = match file.data().pread_with(offset, scroll::LE) {
                    Ok(info) => info,
                    Err(_) => continue,
                };
                CacheMapping {
                    address: info.address,
                    size: info.size,
                    file_offset: info.file_offset,
                    file_index,
                    slide_info_file_offset: 0,
                    slide_info_file_size: 0,
                }
            };
            self.mappings.push(mapping);
        }

        self.files.push(file);
    }

    fn read_images(&mut self) -> Result<()> {
        let header = self.files[0].header;
        let (offset, count) = if header.contains_field(header_field::IMAGES_OFFSET) {
            (header.images_offset, header.images_count)
        } else {
            (header.images_offset_old, header.images_count_old)
        };

        for i in 0..count as usize {
            let image: ImageInfo = self
                .read(0, offset as u64 + (i * ImageInfo::SIZE) as u64)
                .map_err(|_| ExtractError::ContainerParse("truncated image table".into()))?;
            self.images.push(image);
        }
        Ok(())
    }

    fn has_sub_caches(&self) -> bool {
        let header = &self.files[0].header;
        if header.contains_field(header_field::SUB_CACHE_ARRAY_COUNT)
            && header.sub_cache_array_count != 0
        {
            return true;
        }

        header.contains_field(header_field::SYMBOL_FILE_UUID)
            && header.symbol_file_uuid != [0u8; 16]
    }

    fn add_sub_caches(&mut self, main_path: &Path) -> Result<()> {
        if !self.has_sub_caches() {
            return Ok(());
        }

        let header = self.files[0].header;
        let entries_start = header.sub_cache_array_offset as usize;
        // cacheType 2 gained a file-suffix field in the entries
        let uses_v2 = header.cache_type == 2;

        for i in 0..header.sub_cache_array_count as usize {
            let sub_path = if uses_v2 {
                let offset = entries_start + i * SubCacheEntryV2::SIZE;
                let entry: SubCacheEntryV2 =
                    self.files[0].data().pread_with(offset, scroll::LE)?;
                path_with_suffix(main_path, &suffix_string(&entry.file_suffix))
            } else {
                let offset = entries_start + i * SubCacheEntryV1::SIZE;
                let _entry: SubCacheEntryV1 =
                    self.files[0].data().pread_with(offset, scroll::LE)?;
                // siblings use a 1-based index extension
                path_with_suffix(main_path, &format!(".{}", i + 1))
            };

            let file = CacheFile::open(&sub_path)?;
            self.add_file(file);
        }

        if header.contains_field(header_field::SYMBOL_FILE_UUID)
            && header.symbol_file_uuid != [0u8; 16]
        {
            let file = CacheFile::open(&path_with_suffix(main_path, ".symbols"))?;
            self.add_file(file);
        }

        Ok(())
    }

    /// Finds the `.symbols` sibling by matching its UUID against the
    /// main header. With no sub-caches the main file holds the local
    /// symbols itself.
    pub fn symbols_file(&self) -> Option<usize> {
        let header = &self.files[0].header;
        if self.files.len() == 1 || !header.contains_field(header_field::SYMBOL_FILE_UUID) {
            return Some(0);
        }

        self.files
            .iter()
            .position(|file| file.header.uuid == header.symbol_file_uuid)
    }

    /// Converts a vmaddr into the file that maps it and the offset
    /// inside that file.
    pub fn resolve_addr(&self, vmaddr: u64) -> Option<(usize, u64)> {
        self.mappings.iter().find_map(|mapping| {
            mapping
                .contains_addr(vmaddr)
                .then(|| (mapping.file_index, mapping.file_offset + (vmaddr - mapping.address)))
        })
    }

    pub fn data(&self, file_index: usize) -> &[u8] {
        &self.files[file_index].map
    }

    pub fn data_mut(&mut self, file_index: usize) -> &mut [u8] {
        &mut self.files[file_index].map
    }

    /// Reads a structure at the given file offset.
    pub fn read<T>(&self, file_index: usize, offset: u64) -> Result<T>
    where
        T: for<'a> TryFromCtx<'a, scroll::Endian, [u8], Error = scroll::Error>,
    {
        Ok(self.data(file_index).pread_with(offset as usize, scroll::LE)?)
    }

    /// Writes a structure back at the given file offset.
    pub fn write<T>(&mut self, file_index: usize, offset: u64, value: T) -> Result<()>
    where
        T: TryIntoCtx<scroll::Endian, [u8], Error = scroll::Error>,
    {
        self.data_mut(file_index)
            .pwrite_with(value, offset as usize, scroll::LE)?;
        Ok(())
    }

    pub fn read_bytes(&self, file_index: usize, offset: u64, len: usize) -> Result<&[u8]> {
        let offset = offset as usize;
        self.data(file_index)
            .get(offset..offset + len)
            .ok_or_else(|| ExtractError::ContainerParse("read beyond end of cache file".into()))
    }

    pub fn write_bytes(&mut self, file_index: usize, offset: u64, bytes: &[u8]) -> Result<()> {
        let offset = offset as usize;
        self.data_mut(file_index)
            .get_mut(offset..offset + bytes.len())
            .ok_or_else(|| ExtractError::ContainerParse("write beyond end of cache file".into()))?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Reads a NUL-terminated string, including the NUL.
    pub fn read_cstring(&self, file_index: usize, offset: u64) -> Result<Vec<u8>> {
        let data = self.data(file_index);
        let tail = data.get(offset as usize..).ok_or_else(|| {
            ExtractError::ContainerParse("string offset beyond end of cache file".into())
        })?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ExtractError::ContainerParse("unterminated string".into()))?;
        Ok(tail[..end + 1].to_vec())
    }

    /// Lists `(index, name, path)` for every image in the cache.
    pub fn list_images(&self) -> Vec<(usize, String, String)> {
        self.images
            .iter()
            .enumerate()
            .map(|(index, image)| {
                let path = self
                    .read_cstring(0, image.path_file_offset as u64)
                    .map(|raw| String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned())
                    .unwrap_or_default();
                let name = path.rsplit('/').next().unwrap_or_default().to_owned();
                (index, name, path)
            })
            .collect()
    }

    /// Looks up an image by the trailing component of its install path.
    pub fn image_index_by_name(&self, name: &str) -> Option<usize> {
        self.list_images()
            .iter()
            .find(|(_, image_name, _)| image_name.eq_ignore_ascii_case(name))
            .map(|(index, _, _)| *index)
    }
}

fn suffix_string(raw: &[u8; 32]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_paths_append_suffixes() {
        let main = Path::new("/tmp/dyld_shared_cache_arm64e");
        assert_eq!(
            path_with_suffix(main, ".1"),
            Path::new("/tmp/dyld_shared_cache_arm64e.1")
        );
        assert_eq!(
            path_with_suffix(main, ".symbols"),
            Path::new("/tmp/dyld_shared_cache_arm64e.symbols")
        );
    }
}
