use anyhow::{Context, Result, anyhow};
use btf::btf::{Btf, Struct, Type};
use std::env;
use tuner_ebpf_common::KernelLayout;

const KERNEL_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";
const ENV_KERNEL_BTF_PATH: &str = "TUNER_KERNEL_BTF";

pub struct KernelLayoutResult {
    pub layout: KernelLayout,
    /// Why the filemap_fault chain could not be resolved, if it could not.
    pub file_chain_error: Option<String>,
}

/// Reads the kernel's BTF and resolves every struct offset the probes chase.
/// Task offsets are required; the file-fault chain is best effort.
pub fn derive_kernel_layout() -> Result<KernelLayoutResult> {
    let btf_path = env::var(ENV_KERNEL_BTF_PATH).unwrap_or_else(|_| KERNEL_BTF_PATH.to_string());
    let btf = Btf::from_file(&btf_path)
        .with_context(|| format!("failed to load kernel BTF metadata from {btf_path}"))?;

    let task_struct = expect_named_struct(&btf, "task_struct")?;
    let (pid_bits, _) = member_offset(task_struct, "pid")?;
    let (tgid_bits, _) = member_offset(task_struct, "tgid")?;

    let mut layout = KernelLayout::zeroed();
    layout.task_pid_offset = to_bytes(pid_bits)?;
    layout.task_tgid_offset = to_bytes(tgid_bits)?;

    let file_chain_error = match resolve_file_chain(&btf, &mut layout) {
        Ok(()) => {
            layout.file_chain_ready = 1;
            None
        }
        Err(err) => Some(format!("{err:#}")),
    };

    Ok(KernelLayoutResult {
        layout,
        file_chain_error,
    })
}

fn resolve_file_chain(btf: &Btf, layout: &mut KernelLayout) -> Result<()> {
    let vm_fault = expect_named_struct(btf, "vm_fault")?;
    layout.vm_fault_vma_offset = nested_offset(btf, vm_fault, "vma")?;
    layout.vm_fault_pgoff_offset = nested_offset(btf, vm_fault, "pgoff")?;

    let vma = expect_named_struct(btf, "vm_area_struct")?;
    layout.vma_vm_file_offset = nested_offset(btf, vma, "vm_file")?;

    let file = expect_named_struct(btf, "file")?;
    layout.file_f_inode_offset = nested_offset(btf, file, "f_inode")?;

    let inode = expect_named_struct(btf, "inode")?;
    layout.inode_i_ino_offset = nested_offset(btf, inode, "i_ino")?;
    layout.inode_i_sb_offset = nested_offset(btf, inode, "i_sb")?;

    let super_block = expect_named_struct(btf, "super_block")?;
    layout.super_block_s_dev_offset = nested_offset(btf, super_block, "s_dev")?;
    Ok(())
}

/// Byte offset of `name`, looking through anonymous inline structs.
fn nested_offset(btf: &Btf, st: &Struct, name: &str) -> Result<u32> {
    let (bits, _) = find_member_recursive(btf, st, 0, name)?
        .ok_or_else(|| anyhow!("member {name} not found"))?;
    to_bytes(bits)
}

fn find_member_recursive(
    btf: &Btf,
    st: &Struct,
    base_bits: u32,
    target: &str,
) -> Result<Option<(u32, u32)>> {
    for member in &st.members {
        let member_bits = base_bits + member.offset;
        if member.name.as_deref() == Some(target) {
            return Ok(Some((member_bits, member.type_id)));
        }

        if is_inline_container(member.name.as_deref())
            && let Some(inner) = struct_if_inline(btf, member.type_id)?
            && let Some(result) = find_member_recursive(btf, inner, member_bits, target)?
        {
            return Ok(Some(result));
        }
    }

    Ok(None)
}

fn is_inline_container(name: Option<&str>) -> bool {
    match name {
        None => true,
        Some(n) => {
            let trimmed = n.trim();
            trimmed.is_empty() || trimmed == "(anon)"
        }
    }
}

fn struct_if_inline(btf: &Btf, mut type_id: u32) -> Result<Option<&Struct>> {
    for _ in 0..32 {
        let ty = btf
            .get_type_by_id(type_id)
            .with_context(|| format!("failed to resolve nested type id {type_id}"))?;
        match &ty.base_type {
            Type::Struct(st) => return Ok(Some(st)),
            Type::Const(map)
            | Type::Volatile(map)
            | Type::Restrict(map)
            | Type::Typedef(map)
            | Type::TypeTag(map) => {
                type_id = map.type_id;
            }
            _ => return Ok(None),
        }
    }

    Err(anyhow!(
        "type resolution exceeded while examining nested struct (type id {type_id})"
    ))
}

fn expect_named_struct<'a>(btf: &'a Btf, name: &str) -> Result<&'a Struct> {
    let ty = btf
        .get_type_by_name(name)
        .with_context(|| format!("type {name} not found in BTF"))?;
    match &ty.base_type {
        Type::Struct(st) => Ok(st),
        other => Err(anyhow!("type {name} is not a struct (found {:?})", other)),
    }
}

fn member_offset(st: &Struct, name: &str) -> Result<(u32, u32)> {
    st.members
        .iter()
        .find(|member| member.name.as_deref() == Some(name))
        .map(|member| (member.offset, member.type_id))
        .ok_or_else(|| anyhow!("member {name} not found"))
}

#[allow(clippy::manual_is_multiple_of)] // is_multiple_of not stable in nightly-2024-12-10
fn to_bytes(bits: u32) -> Result<u32> {
    if bits % 8 == 0 {
        Ok(bits / 8)
    } else {
        Err(anyhow!("member offset {bits} is not byte aligned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_bytes_rejects_bitfields() {
        assert_eq!(to_bytes(0).unwrap(), 0);
        assert_eq!(to_bytes(64).unwrap(), 8);
        assert!(to_bytes(3).is_err());
    }

    #[test]
    fn anonymous_members_are_inline_containers() {
        assert!(is_inline_container(None));
        assert!(is_inline_container(Some("")));
        assert!(is_inline_container(Some("(anon)")));
        assert!(!is_inline_container(Some("vma")));
    }

    #[test]
    fn missing_btf_file_is_an_error() {
        unsafe {
            std::env::set_var(ENV_KERNEL_BTF_PATH, "/nonexistent/vmlinux");
        }
        let result = derive_kernel_layout();
        unsafe {
            std::env::remove_var(ENV_KERNEL_BTF_PATH);
        }
        assert!(result.is_err());
    }
}
