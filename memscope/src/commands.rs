//! Command handlers for the memscope CLI.

use anyhow::{bail, Context, Result};
use memscope_lib::memory::{io, pattern::scan_process};
use memscope_lib::process::{retrieve_process_exe, retrieve_process_name};
use memscope_lib::{
    PageInfo, Pattern, ProcessAccess, ProcessHandle, Protection, RawPointer, SignatureScanner,
    Value, ValueKind,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::cli::Commands;
use crate::models::{
    AddressModel, ModuleModel, PageInfoModel, ProcessInfoModel, ProtectionModel, ReadModel,
};

const QUERY: ProcessAccess = ProcessAccess::QUERY_INFORMATION;

/// Rights a command needs on the target.
pub fn required_access(command: &Commands) -> ProcessAccess {
    match command {
        Commands::Info | Commands::Query { .. } | Commands::Regions { .. } | Commands::Modules => {
            QUERY
        }
        Commands::Read { .. } | Commands::Chain { .. } => ProcessAccess::VM_READ,
        Commands::Write { .. } => ProcessAccess::VM_READ | ProcessAccess::VM_WRITE | ProcessAccess::VM_OPERATION,
        Commands::Protect { .. } => ProcessAccess::VM_OPERATION | QUERY,
        Commands::Scan { .. } => ProcessAccess::VM_READ | QUERY,
    }
}

pub fn run(handle: &ProcessHandle, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Info => handle_info(handle, json),
        Commands::Query { address } => handle_query(handle, &address, json),
        Commands::Regions { committed } => handle_regions(handle, committed, json),
        Commands::Modules => handle_modules(handle, json),
        Commands::Read { address, len, kind } => handle_read(handle, &address, len, kind.as_deref(), json),
        Commands::Write {
            address,
            data,
            kind,
        } => handle_write(handle, &address, &data, kind.as_deref()),
        Commands::Protect {
            address,
            len,
            protection,
        } => handle_protect(handle, &address, len, &protection, json),
        Commands::Scan {
            pattern,
            module,
            max_region_size,
        } => handle_scan(handle, &pattern, module.as_deref(), max_region_size, json),
        Commands::Chain { base, offsets } => handle_chain(handle, &base, &offsets, json),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a hex or decimal address string
pub fn parse_address(address: &str) -> Result<RawPointer<u8>> {
    address
        .parse()
        .with_context(|| format!("Invalid address: {address}"))
}

/// Parse a signed hex or decimal offset such as `0x10` or `-0x8`
pub fn parse_offset(offset: &str) -> Result<isize> {
    let (negative, magnitude) = match offset.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, offset),
    };

    let value = match magnitude
        .strip_prefix("0x")
        .or_else(|| magnitude.strip_prefix("0X"))
    {
        Some(hex) => isize::from_str_radix(hex, 16),
        None => magnitude.parse::<isize>(),
    }
    .with_context(|| format!("Invalid offset: {offset}"))?;

    Ok(if negative { -value } else { value })
}

/// Parse hex bytes from space-separated tokens
pub fn parse_hex_bytes(parts: &[String]) -> Result<Vec<u8>> {
    parts
        .iter()
        .flat_map(|part| part.split_whitespace())
        .map(|part| {
            u8::from_str_radix(part, 16).with_context(|| format!("Invalid hex byte: {part}"))
        })
        .collect()
}

/// Parse an rwx string ("r-x") or a raw protection value ("0x40")
pub fn parse_protection(protection: &str) -> Result<Protection> {
    let text = protection.trim();

    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        let bits = u32::from_str_radix(hex, 16).with_context(|| format!("Invalid protection: {protection}"))?;
        return Ok(Protection::from_bits_retain(bits));
    }

    if let Ok(bits) = text.parse::<u32>() {
        return Ok(Protection::from_bits_retain(bits));
    }

    let flags = text.as_bytes();
    if flags.len() != 3 || !flags.iter().all(|flag| b"rwx-".contains(flag)) {
        bail!("Invalid protection: {protection} (expected e.g. \"rw-\" or 0x04)");
    }

    Ok(Protection::from_rwx(flags[0] == b'r', flags[1] == b'w', flags[2] == b'x'))
}

fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_hex_dump(address: usize, data: &[u8]) {
    for (i, chunk) in data.chunks(16).enumerate() {
        print!("{:016x}  ", address.wrapping_add(i * 16));
        for j in 0..16 {
            match chunk.get(j) {
                Some(byte) => print!("{byte:02x} "),
                None => print!("   "),
            }
            if j == 7 {
                print!(" ");
            }
        }
        print!(" |");
        for byte in chunk {
            let c = *byte as char;
            if c.is_ascii_graphic() || c == ' ' {
                print!("{c}");
            } else {
                print!(".");
            }
        }
        println!("|");
    }
}

fn handle_info(handle: &ProcessHandle, json: bool) -> Result<()> {
    let pid = handle.pid();
    let model = ProcessInfoModel {
        pid,
        name: retrieve_process_name(pid).ok(),
        exe: retrieve_process_exe(pid).ok().map(|exe| exe.display().to_string()),
        module_count: handle.modules().ok().map(|modules| modules.len()),
    };

    if json {
        return print_json(&model);
    }

    println!("pid:     {}", model.pid);
    println!("name:    {}", model.name.as_deref().unwrap_or("?"));
    println!("exe:     {}", model.exe.as_deref().unwrap_or("?"));
    match model.module_count {
        Some(count) => println!("modules: {count}"),
        None => println!("modules: ?"),
    }

    Ok(())
}

fn print_page(info: &PageInfoModel) {
    println!(
        "{:>18}  {:>12x}  {:<7}  {:<4}  {:<7}  alloc {} ({})",
        info.base_address,
        info.region_size,
        info.state,
        info.protect.rwx,
        info.page_type,
        info.allocation_base,
        info.allocation_protect.rwx,
    );
}

fn handle_query(handle: &ProcessHandle, address: &str, json: bool) -> Result<()> {
    let address = parse_address(address)?;
    let info = handle
        .query(address)
        .with_context(|| format!("Failed to query {address}"))?;
    let model = PageInfoModel::from(&info);

    if json {
        return print_json(&model);
    }

    print_page(&model);
    Ok(())
}

fn handle_regions(handle: &ProcessHandle, committed: bool, json: bool) -> Result<()> {
    let mut models = Vec::new();

    for info in handle.regions() {
        let info = info.context("Failed to walk regions")?;
        if committed && !info.is_committed() {
            continue;
        }
        models.push(PageInfoModel::from(&info));
    }

    if json {
        return print_json(&models);
    }

    for model in &models {
        print_page(model);
    }
    println!("{} regions", models.len());

    Ok(())
}

fn handle_modules(handle: &ProcessHandle, json: bool) -> Result<()> {
    let modules = handle.modules().context("Failed to list modules")?;
    let models: Vec<ModuleModel> = modules.iter().map(ModuleModel::from).collect();

    if json {
        return print_json(&models);
    }

    for model in &models {
        println!("{:>18}  {:>10x}  {:<24}  {}", model.base, model.size, model.name, model.path);
    }

    Ok(())
}

fn handle_read(
    handle: &ProcessHandle,
    address: &str,
    len: usize,
    kind: Option<&str>,
    json: bool,
) -> Result<()> {
    let address = parse_address(address)?;

    let model = match kind {
        Some(kind) => {
            let kind: ValueKind = kind.parse()?;
            let value = io::read_any(handle, address, kind)?;
            ReadModel {
                address: format!("{address:#x}"),
                bytes: None,
                kind: Some(kind.to_string()),
                value: Some(value.to_string()),
            }
        }
        None => {
            let data = io::read_bytes(handle, address, len)?;
            if !json {
                println!("Reading {} bytes at {:#x}:", len, address);
                print_hex_dump(address.address(), &data);
                return Ok(());
            }
            ReadModel {
                address: format!("{address:#x}"),
                bytes: Some(hex_string(&data)),
                kind: None,
                value: None,
            }
        }
    };

    if json {
        return print_json(&model);
    }

    println!(
        "{} {} = {}",
        model.address,
        model.kind.as_deref().unwrap_or_default(),
        model.value.as_deref().unwrap_or_default()
    );
    Ok(())
}

fn handle_write(handle: &ProcessHandle, address: &str, data: &[String], kind: Option<&str>) -> Result<()> {
    let address = parse_address(address)?;

    let bytes = match kind {
        Some(kind) => {
            let kind: ValueKind = kind.parse()?;
            let [text] = data else {
                bail!("Expected exactly one value for --kind {kind}");
            };
            Value::parse(kind, text)?.to_ne_bytes()
        }
        None => parse_hex_bytes(data)?,
    };

    let original = io::read_bytes(handle, address, bytes.len())?;
    println!("Original: {}", hex_string(&original));
    println!("New:      {}", hex_string(&bytes));

    io::write_bytes(handle, address, &bytes)?;
    info!(address = %address, len = bytes.len(), "wrote memory");

    Ok(())
}

fn handle_protect(
    handle: &ProcessHandle,
    address: &str,
    len: usize,
    protection: &str,
    json: bool,
) -> Result<()> {
    let address = parse_address(address)?;
    let protection = parse_protection(protection)?;

    let previous = handle
        .set_protection(address, len, protection)
        .with_context(|| format!("Failed to change protection at {address}"))?;

    if json {
        return print_json(&ProtectionModel::from(previous));
    }

    println!(
        "{} -> {} (previous {:#x})",
        previous.to_rwx_string(),
        protection.to_rwx_string(),
        previous.bits()
    );
    Ok(())
}

/// Whether a process-wide scan should copy `info`; a `max_size` of zero
/// accepts every region.
pub fn within_scan_limit(info: &PageInfo, max_size: usize) -> bool {
    if max_size != 0 && info.region_size > max_size {
        debug!(region = %info.region(), max_size, "skipping oversized region");
        return false;
    }

    true
}

fn handle_scan(
    handle: &ProcessHandle,
    pattern: &str,
    module: Option<&str>,
    max_region_size: usize,
    json: bool,
) -> Result<()> {
    let pattern: Pattern = pattern.parse()?;

    let found = match module {
        Some(name) => {
            let module = handle.find_module(name)?;
            SignatureScanner::from_module(handle, &module)?.find_pattern(&pattern)
        }
        None => scan_process(handle, &pattern, |info| within_scan_limit(info, max_region_size))?,
    };

    if json {
        return print_json(&AddressModel::new(found.map(RawPointer::address)));
    }

    match found {
        Some(address) => println!("{address}"),
        None => println!("No matches found."),
    }

    Ok(())
}

fn handle_chain(handle: &ProcessHandle, base: &str, offsets: &[String], json: bool) -> Result<()> {
    let base = parse_address(base)?;
    let offsets = offsets
        .iter()
        .map(|offset| parse_offset(offset))
        .collect::<Result<Vec<_>>>()?;

    let address = io::resolve_pointer_chain(handle, base, &offsets)?;

    if json {
        return print_json(&AddressModel::new(Some(address.address())));
    }

    println!("{address}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use memscope_lib::{PageState, PageType};

    use super::*;
    use crate::cli::DEFAULT_MAX_REGION_SIZE;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x1000").unwrap().address(), 0x1000);
        assert_eq!(parse_address("4096").unwrap().address(), 4096);
        assert!(parse_address("0xZZ").is_err());
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("0x10").unwrap(), 0x10);
        assert_eq!(parse_offset("-0x8").unwrap(), -8);
        assert_eq!(parse_offset("24").unwrap(), 24);
        assert!(parse_offset("-").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        let parts = vec!["90 90".to_string(), "C3".to_string()];
        assert_eq!(parse_hex_bytes(&parts).unwrap(), vec![0x90, 0x90, 0xC3]);
        assert!(parse_hex_bytes(&["XY".to_string()]).is_err());
    }

    #[test]
    fn test_parse_protection() {
        assert_eq!(parse_protection("r-x").unwrap(), Protection::EXECUTE_READ);
        assert_eq!(parse_protection("rw-").unwrap(), Protection::READ_WRITE);
        assert_eq!(parse_protection("---").unwrap(), Protection::NO_ACCESS);
        assert_eq!(parse_protection("0x40").unwrap(), Protection::EXECUTE_READ_WRITE);
        assert_eq!(parse_protection("2").unwrap(), Protection::READ_ONLY);
        assert!(parse_protection("rwxx").is_err());
    }

    #[test]
    fn test_required_access() {
        assert!(required_access(&Commands::Modules).contains(ProcessAccess::QUERY_INFORMATION));
        assert!(required_access(&Commands::Read {
            address: "0".to_string(),
            len: 1,
            kind: None,
        })
        .contains(ProcessAccess::VM_READ));
    }

    #[test]
    fn test_within_scan_limit() {
        let info = PageInfo {
            base_address: RawPointer::new(0x10000),
            allocation_base: RawPointer::new(0x10000),
            allocation_protect: Protection::READ_WRITE,
            region_size: 0x4000_0000,
            state: PageState::COMMIT,
            protect: Protection::READ_WRITE,
            page_type: PageType::PRIVATE,
        };

        assert!(!within_scan_limit(&info, DEFAULT_MAX_REGION_SIZE));
        assert!(within_scan_limit(&info, 0));
        assert!(within_scan_limit(&PageInfo { region_size: 0x1000, ..info }, DEFAULT_MAX_REGION_SIZE));
    }
}
