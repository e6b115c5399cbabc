//! Relocation descriptors: collection from REL sections and application
//! to program instruction streams.

use crate::elf::Sym;
use crate::error::{Error, Result};
use crate::insn::{self, Insn, OP_JMP_CALL, OP_LD_IMM_DW, PSEUDO_CALL, PSEUDO_MAP_FD};
use crate::maps::Map;
use crate::programs::Program;

/// Encoded size of one REL entry.
const REL_ENTRY_SIZE: usize = 16;

/// One collected fixup, owned by its program until the relocator
/// consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocDesc {
    /// Wide-immediate load to be stamped with a map descriptor.
    Ld64 { insn_idx: usize, map_idx: usize },
    /// Pseudo-call whose target lives in the shared `.text` pool.
    Call { insn_idx: usize, text_off: u64 },
}

/// Translate one REL section's entries into descriptors on `prog`.
///
/// Returns whether any pseudo-call relocation was seen. Entries must
/// reference a symbol in the maps section or in `.text`, and must cover
/// either a pseudo-call or a wide-immediate load; anything else is a
/// relocation failure.
pub(crate) fn collect(
    prog: &mut Program,
    rel_data: &[u8],
    entsize: usize,
    symbols: &[Sym],
    maps: &[Map],
    maps_shndx: Option<usize>,
    text_shndx: Option<usize>,
) -> Result<bool> {
    if entsize < REL_ENTRY_SIZE {
        log::warn!(
            "relocation section for '{}' has entry size {}",
            prog.section_name(),
            entsize
        );
        return Err(Error::Format);
    }
    let nrels = rel_data.len() / entsize;
    log::debug!("collecting {} relocations for '{}'", nrels, prog.section_name());

    let mut relocs = Vec::with_capacity(nrels);
    let mut saw_pseudo_call = false;
    for i in 0..nrels {
        let ent = &rel_data[i * entsize..i * entsize + REL_ENTRY_SIZE];
        let r_offset = u64::from_le_bytes(ent[0..8].try_into().expect("bounds checked"));
        let r_info = u64::from_le_bytes(ent[8..16].try_into().expect("bounds checked"));

        let sym_idx = (r_info >> 32) as usize;
        let sym = *symbols.get(sym_idx).ok_or_else(|| {
            log::warn!(
                "relocation {} of '{}' references symbol {} beyond the table",
                i,
                prog.section_name(),
                sym_idx
            );
            Error::Format
        })?;

        let sym_shndx = sym.shndx as usize;
        if Some(sym_shndx) != maps_shndx && Some(sym_shndx) != text_shndx {
            log::warn!(
                "relocation {} of '{}' targets unexpected section {}",
                i,
                prog.section_name(),
                sym_shndx
            );
            return Err(Error::Reloc);
        }

        let insn_idx = (r_offset as usize) / insn::INSN_SIZE;
        let Some(target) = prog.insns().get(insn_idx).copied() else {
            log::warn!(
                "relocation {} of '{}' covers instruction {} beyond the program",
                i,
                prog.section_name(),
                insn_idx
            );
            return Err(Error::Reloc);
        };

        if target.code == OP_JMP_CALL {
            if target.src_reg() != PSEUDO_CALL {
                log::warn!(
                    "'{}' instruction {} is a call without the pseudo-call tag",
                    prog.section_name(),
                    insn_idx
                );
                return Err(Error::Reloc);
            }
            relocs.push(RelocDesc::Call {
                insn_idx,
                text_off: sym.value,
            });
            saw_pseudo_call = true;
        } else if target.code == OP_LD_IMM_DW {
            // The maps table is sorted by section offset, so the symbol
            // value identifies the map directly.
            let map_idx = maps
                .binary_search_by_key(&sym.value, |m| m.section_offset())
                .map_err(|_| {
                    log::warn!(
                        "'{}' instruction {} references unknown map offset {}",
                        prog.section_name(),
                        insn_idx,
                        sym.value
                    );
                    Error::Reloc
                })?;
            relocs.push(RelocDesc::Ld64 { insn_idx, map_idx });
        } else {
            log::warn!(
                "relocation {} of '{}' covers unexpected opcode {:#04x}",
                i,
                prog.section_name(),
                target.code
            );
            return Err(Error::Reloc);
        }
    }

    prog.set_relocs(relocs);
    Ok(saw_pseudo_call)
}

/// Apply and consume every descriptor on `prog`.
///
/// `Ld64` stamps the wide load with the pseudo-map-fd tag and the map's
/// descriptor. `Call` splices the shared `.text` pool onto the caller
/// (once) and rebases the call immediate against the splice point; a
/// call relocation on `.text` itself is refused.
pub(crate) fn apply(
    prog: &mut Program,
    maps: &[Map],
    text_shndx: Option<usize>,
    text_insns: Option<&[Insn]>,
) -> Result<()> {
    let relocs = prog.take_relocs();
    for desc in relocs {
        match desc {
            RelocDesc::Ld64 { insn_idx, map_idx } => {
                if insn_idx >= prog.insn_cnt() {
                    log::warn!(
                        "'{}': map relocation out of range at instruction {}",
                        prog.section_name(),
                        insn_idx
                    );
                    return Err(Error::Reloc);
                }
                let fd = maps[map_idx].fd();
                let insn = prog.insn_mut(insn_idx);
                insn.set_src_reg(PSEUDO_MAP_FD);
                insn.imm = fd;
            }
            RelocDesc::Call { insn_idx, text_off } => {
                if Some(prog.section_index()) == text_shndx {
                    log::warn!("relocation against a call inside '.text' itself");
                    return Err(Error::Reloc);
                }
                let Some(text) = text_insns else {
                    log::warn!(
                        "'{}' calls into '.text' but the object has none",
                        prog.section_name(),
                    );
                    return Err(Error::Reloc);
                };
                if insn_idx >= prog.insn_cnt() {
                    log::warn!(
                        "'{}': call relocation out of range at instruction {}",
                        prog.section_name(),
                        insn_idx
                    );
                    return Err(Error::Reloc);
                }
                if prog.main_insn_cnt() == 0 {
                    prog.splice_text(text);
                    log::debug!(
                        "added {} instructions from '.text' to '{}'",
                        text.len(),
                        prog.section_name()
                    );
                }
                // The callee offset within `.text` is already folded
                // into the immediate; rebase it against the splice
                // point relative to the call site.
                let delta = (prog.main_insn_cnt() - insn_idx) as i32;
                prog.insn_mut(insn_idx).imm += delta;
                log::debug!(
                    "'{}': call at instruction {} resolved to '.text'+{}",
                    prog.section_name(),
                    insn_idx,
                    text_off
                );
            }
        }
    }
    Ok(())
}
