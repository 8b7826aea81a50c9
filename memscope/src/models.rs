use memscope_lib::{Module, PageInfo, PageState, PageType, Protection};
use serde::{Deserialize, Serialize};

fn hex(address: usize) -> String {
    format!("{address:#x}")
}

fn state_name(state: PageState) -> String {
    if state.contains(PageState::COMMIT) {
        "commit".to_string()
    } else if state.contains(PageState::RESERVE) {
        "reserve".to_string()
    } else if state.contains(PageState::FREE) {
        "free".to_string()
    } else {
        format!("{:#x}", state.bits())
    }
}

fn type_name(page_type: PageType) -> String {
    if page_type.contains(PageType::IMAGE) {
        "image".to_string()
    } else if page_type.contains(PageType::MAPPED) {
        "mapped".to_string()
    } else if page_type.contains(PageType::PRIVATE) {
        "private".to_string()
    } else {
        "-".to_string()
    }
}

#[derive(Serialize, Deserialize)]
pub struct ProtectionModel {
    pub bits: u32,
    pub rwx: String,
}

impl From<Protection> for ProtectionModel {
    fn from(protection: Protection) -> Self {
        Self {
            bits: protection.bits(),
            rwx: protection.to_rwx_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct PageInfoModel {
    #[serde(rename = "baseAddress")]
    pub base_address: String,
    #[serde(rename = "allocationBase")]
    pub allocation_base: String,
    #[serde(rename = "allocationProtect")]
    pub allocation_protect: ProtectionModel,
    #[serde(rename = "regionSize")]
    pub region_size: usize,
    pub state: String,
    pub protect: ProtectionModel,
    #[serde(rename = "type")]
    pub page_type: String,
}

impl From<&PageInfo> for PageInfoModel {
    fn from(info: &PageInfo) -> Self {
        Self {
            base_address: hex(info.base_address.address()),
            allocation_base: hex(info.allocation_base.address()),
            allocation_protect: info.allocation_protect.into(),
            region_size: info.region_size,
            state: state_name(info.state),
            protect: info.protect.into(),
            page_type: type_name(info.page_type),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ModuleModel {
    pub name: String,
    pub path: String,
    pub base: String,
    pub size: usize,
}

impl From<&Module> for ModuleModel {
    fn from(module: &Module) -> Self {
        Self {
            name: module.name.clone(),
            path: module.path.display().to_string(),
            base: hex(module.region.low().address()),
            size: module.region.size(),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ProcessInfoModel {
    pub pid: u32,
    pub name: Option<String>,
    pub exe: Option<String>,
    #[serde(rename = "moduleCount")]
    pub module_count: Option<usize>,
}

#[derive(Serialize, Deserialize)]
pub struct ReadModel {
    pub address: String,
    pub bytes: Option<String>,
    pub kind: Option<String>,
    pub value: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct AddressModel {
    pub address: Option<String>,
}

impl AddressModel {
    pub fn new(address: Option<usize>) -> Self {
        Self {
            address: address.map(hex),
        }
    }
}

#[cfg(test)]
mod tests {
    use memscope_lib::RawPointer;

    use super::*;

    #[test]
    fn page_info_serializes_with_readable_fields() {
        let info = PageInfo {
            base_address: RawPointer::new(0x7000),
            allocation_base: RawPointer::new(0x6000),
            allocation_protect: Protection::READ_WRITE,
            region_size: 0x1000,
            state: PageState::COMMIT,
            protect: Protection::EXECUTE_READ,
            page_type: PageType::IMAGE,
        };

        let json = serde_json::to_value(PageInfoModel::from(&info)).unwrap();
        assert_eq!(json["baseAddress"], "0x7000");
        assert_eq!(json["state"], "commit");
        assert_eq!(json["type"], "image");
        assert_eq!(json["protect"]["rwx"], "r-x");
        assert_eq!(json["protect"]["bits"], 0x20);
    }

    #[test]
    fn missing_addresses_serialize_as_null() {
        let json = serde_json::to_string(&AddressModel::new(None)).unwrap();
        assert_eq!(json, r#"{"address":null}"#);
    }

    #[test]
    fn previous_protection_serializes_bits_and_rwx() {
        let json = serde_json::to_value(ProtectionModel::from(Protection::EXECUTE_READ_WRITE)).unwrap();
        assert_eq!(json["bits"], 0x40);
        assert_eq!(json["rwx"], "rwx");
    }
}
