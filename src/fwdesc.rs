//! Firmware descriptor-chain validation.
//!
//! The firmware image carries a chain of self-describing descriptors
//! appended to the code: each one starts with a four byte magic, a little
//! endian length and a version window, and the chain ends with a dedicated
//! terminal descriptor. Nothing else in the driver is allowed to run before
//! this chain has been walked and every mandatory rule below has passed,
//! since the descriptors dictate buffer sizes, addresses the driver will
//! write to and the command interface revision.

use bitfield_struct::bitfield;
use heapless::String;

/// Magic of the mandatory capability descriptor, also the pattern that marks
/// the start of the chain inside the image.
pub const OTUS_MAGIC: [u8; 4] = *b"OTAR";
/// Terminal descriptor.
pub const LAST_MAGIC: [u8; 4] = *b"LAST";
/// Optional checksum descriptor.
pub const CHK_MAGIC: [u8; 4] = *b"CHK\0";
/// Optional free-text build info descriptor.
pub const MOTD_MAGIC: [u8; 4] = *b"MOTD";
/// Optional TX sequence-table descriptor.
pub const TXSQ_MAGIC: [u8; 4] = *b"TXSQ";

pub const DESC_HEAD_SIZE: usize = 8;
pub const OTUS_DESC_SIZE: usize = 32;
pub const CHK_DESC_SIZE: usize = 16;
pub const MOTD_DESC_SIZE: usize = 56;
pub const TXSQ_DESC_SIZE: usize = 12;
pub const LAST_DESC_SIZE: usize = DESC_HEAD_SIZE;

/// The chain never extends past this many bytes, cyclic or not.
pub const DESC_CHAIN_MAX_LENGTH: usize = 8192;

pub const FW_MIN_SIZE: usize = 32;
pub const FW_MAX_SIZE: usize = 16384;

/// Command interface revisions this driver can talk to.
pub const API_MIN_VER: u8 = 1;
pub const API_MAX_VER: u8 = 1;

const OTUS_DESC_CUR_VER: u8 = 7;
const CHK_DESC_CUR_VER: u8 = 2;
const LAST_DESC_CUR_VER: u8 = 2;
const MOTD_DESC_CUR_VER: u8 = 1;
const TXSQ_DESC_CUR_VER: u8 = 1;

const MOTD_STRING_LEN: usize = 24;
pub const MOTD_RELEASE_LEN: usize = 20;

// Device memory map, for address sanity checks.
const SRAM_OFFSET: u32 = 0x10_0000;
const SRAM_SIZE: u32 = 0x1_8000;
const PRAM_OFFSET: u32 = 0x20_0000;
const PRAM_SIZE: u32 = 0x8000;

const MAX_VIRTUAL_MAC: u8 = 7;
/// Minimum beacon buffer for ad-hoc beaconing to be usable.
const BCN_LENGTH_MAX: u16 = 512 - 32;

const FEATURE_NUM: u32 = 18;

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FirmwareFeatures {
    /// Always set; its absence means the word is garbage.
    pub dummy: bool,
    /// Image starts with a boot block that must be skipped when uploading.
    pub miniboot: bool,
    pub usb_init_firmware: bool,
    pub usb_resp_ep2: bool,
    pub usb_down_stream: bool,
    pub usb_up_stream: bool,
    /// The build knows itself to be broken.
    pub unusable: bool,
    /// PHY programming goes through commands instead of register pokes.
    pub command_phy: bool,
    /// Crypto offload engine is driven through commands.
    pub command_cam: bool,
    pub wlan_tx_cab: bool,
    /// Firmware answers block-ack requests on its own.
    pub handle_back_req: bool,
    pub gpio_interrupt: bool,
    pub psm: bool,
    pub rx_filter: bool,
    pub wol: bool,
    pub fixed_5ghz_psm: bool,
    pub hw_counters: bool,
    pub rx_ba_filter: bool,
    #[bits(14)]
    pub __: u32,
}

/// Why the image was refused. Any of these aborts bring-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FirmwareError {
    /// Image smaller than the minimal chain or larger than the part can hold.
    ImageSize,
    /// The capability magic does not occur anywhere in the image.
    DescriptorChainNotFound,
    /// A descriptor head would cross the end of the scan window.
    TruncatedDescriptor,
    /// A descriptor declares less than a bare head.
    RuntDescriptor,
    /// A descriptor declares more than the remaining chain budget.
    OversizedDescriptor,
    /// A descriptor body would cross the end of the scan window.
    DescriptorOutOfBounds,
    /// No compatible terminal descriptor within the chain budget.
    UnterminatedChain,
    /// No compatible capability descriptor in the chain.
    MissingCapabilityDescriptor,
    /// The feature word fails its self-check.
    InvalidDescriptorFormat,
    UnsupportedApiVersion { version: u8 },
    /// Command-driven PHY control or block-ack handling missing, or the
    /// image marks itself unusable.
    MissingMandatoryFeatures,
    /// The firmware cannot be started over this transport.
    MissingMandatoryInterfaces,
    /// Memory layout or referenced addresses outside the known-sane bounds.
    TamperedMemoryLayout,
    InvalidSequenceTableAddress,
    /// Too little data covered by the checksum to mean anything.
    ChecksumRegionTooShort,
    ImageChecksumMismatch,
    DescriptorChecksumMismatch,
}

pub type FirmwareResult<T> = Result<T, FirmwareError>;

/// Everything bring-up needs to know about the validated image.
///
/// Built once by [`parse_firmware`] and immutable from then on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub features: FirmwareFeatures,
    pub api_version: u8,
    pub vif_count: u8,
    pub cmd_buffer_count: u8,
    pub mem_block_count: u8,
    pub mem_block_size: u16,
    pub rx_buffer_size: u16,
    /// Entry point the loader jumps to.
    pub firmware_address: u32,
    pub beacon_address: u32,
    pub beacon_max_len: u16,
    /// Bytes of miniboot code to skip when uploading.
    pub miniboot_offset: u16,
    pub rx_stream: bool,
    pub tx_stream: bool,
    pub rx_filter: bool,
    pub hw_counters: bool,
    pub ba_filter: bool,
    pub power_save: bool,
    /// Crypto offload missing, encryption falls back to software.
    pub disable_offload: bool,
    /// Beacon buffer is usable for ad-hoc beaconing.
    pub adhoc_beaconing: bool,
    pub tx_seq_table: Option<u32>,
    /// The image carried no checksum descriptor if false.
    pub checksum_protected: bool,
    pub release: Option<String<MOTD_RELEASE_LEN>>,
}

/// One descriptor head, decoded off the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DescHead {
    magic: [u8; 4],
    length: u16,
    min_ver: u8,
    cur_ver: u8,
}
impl DescHead {
    fn parse(bytes: &[u8]) -> Option<Self> {
        let head = bytes.get(..DESC_HEAD_SIZE)?;
        Some(Self {
            magic: head[..4].try_into().unwrap(),
            length: u16::from_le_bytes(head[4..6].try_into().unwrap()),
            min_ver: head[6],
            cur_ver: head[7],
        })
    }
    /// The compatibility test every lookup goes through: magic, minimum
    /// size and that `revision` falls into the descriptor's version window.
    fn compatible(&self, magic: [u8; 4], min_len: usize, revision: u8) -> bool {
        self.magic == magic
            && self.min_ver <= revision
            && revision <= self.cur_ver
            && self.length as usize >= min_len
    }
}

fn valid_dma_addr(address: u32) -> bool {
    (SRAM_OFFSET..SRAM_OFFSET + SRAM_SIZE).contains(&address)
}

fn valid_cpu_addr(address: u32) -> bool {
    valid_dma_addr(address) || (PRAM_OFFSET..PRAM_OFFSET + PRAM_SIZE).contains(&address)
}

/// CRC32 with an explicit seed and no final inversion, the convention the
/// firmware build tool chains its two checksums with.
fn crc32_le(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(!seed);
    hasher.update(data);
    !hasher.finalize()
}

fn read_le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

fn read_le32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// Locate the start of the descriptor chain: the first occurrence of the
/// capability magic, found with an incremental byte-at-a-time match so the
/// scan never reads past the image.
fn find_desc_chain(image: &[u8]) -> Option<usize> {
    let mut found = 0;
    for (scan, &byte) in image.iter().enumerate() {
        if byte == OTUS_MAGIC[found] {
            found += 1;
        } else {
            found = usize::from(byte == OTUS_MAGIC[0]);
        }
        if found == OTUS_MAGIC.len() {
            let start = scan + 1 - found;
            // The chain must leave room for at least one head.
            return (start + DESC_HEAD_SIZE <= image.len()).then_some(start);
        }
    }
    None
}

/// Walk the chain once, proving that every descriptor stays inside the
/// budget and that a compatible terminal descriptor exists.
///
/// Lengths are at least a head, so every step advances by eight or more
/// bytes and the walk terminates within `DESC_CHAIN_MAX_LENGTH / 8` steps.
fn verify_desc_chain(chain: &[u8]) -> FirmwareResult<()> {
    if chain.len() < DESC_HEAD_SIZE {
        return Err(FirmwareError::TruncatedDescriptor);
    }
    let window = chain.len().min(DESC_CHAIN_MAX_LENGTH);
    let mut pos = 0;
    let mut budget = window;
    while pos < window {
        if pos + DESC_HEAD_SIZE > window {
            return Err(FirmwareError::TruncatedDescriptor);
        }
        let head = DescHead::parse(&chain[pos..]).ok_or(FirmwareError::TruncatedDescriptor)?;
        let length = head.length as usize;
        if length < DESC_HEAD_SIZE {
            return Err(FirmwareError::RuntDescriptor);
        }
        if length > budget {
            return Err(FirmwareError::OversizedDescriptor);
        }
        if pos + length > window {
            return Err(FirmwareError::DescriptorOutOfBounds);
        }
        if head.compatible(LAST_MAGIC, LAST_DESC_SIZE, LAST_DESC_CUR_VER) {
            return Ok(());
        }
        pos += length;
        budget -= length;
    }
    Err(FirmwareError::UnterminatedChain)
}

/// Find a descriptor in the (already verified) chain.
///
/// Returns the offset of its head relative to the chain start.
fn find_desc(chain: &[u8], magic: [u8; 4], min_len: usize, revision: u8) -> Option<usize> {
    let window = chain.len().min(DESC_CHAIN_MAX_LENGTH);
    let mut pos = 0;
    while pos + DESC_HEAD_SIZE <= window {
        let head = DescHead::parse(&chain[pos..])?;
        if head.compatible(magic, min_len, revision) {
            return Some(pos);
        }
        if head.compatible(LAST_MAGIC, LAST_DESC_SIZE, LAST_DESC_CUR_VER) {
            return None;
        }
        pos += head.length as usize;
    }
    None
}

/// Verify the optional checksum descriptor.
///
/// The image checksum covers the code body in front of the chain, the
/// header checksum continues over the descriptors up to the checksum
/// descriptor itself. An image without the descriptor is accepted but runs
/// unprotected.
fn verify_checksum(image: &[u8], chain_offset: usize) -> FirmwareResult<bool> {
    let chain = &image[chain_offset..];
    let Some(chk_offset) = find_desc(chain, CHK_MAGIC, CHK_DESC_SIZE, CHK_DESC_CUR_VER) else {
        warn!("unprotected firmware image, no checksum descriptor");
        return Ok(false);
    };
    let last_offset = find_desc(chain, LAST_MAGIC, LAST_DESC_SIZE, LAST_DESC_CUR_VER)
        .ok_or(FirmwareError::UnterminatedChain)?;

    let chain_total = last_offset + LAST_DESC_SIZE;
    let mut body_len = image.len();
    if chain_total < body_len {
        body_len -= chain_total;
    }
    if body_len < 256 {
        return Err(FirmwareError::ChecksumRegionTooShort);
    }
    let desc_len = chk_offset.min(image.len() - chain_offset);

    let fw_crc = crc32_le(!0, &image[..body_len]);
    if fw_crc != read_le32(chain, chk_offset + DESC_HEAD_SIZE) {
        error!("firmware checksum test failed");
        return Err(FirmwareError::ImageChecksumMismatch);
    }
    let hdr_crc = crc32_le(fw_crc, &chain[..desc_len]);
    if hdr_crc != read_le32(chain, chk_offset + DESC_HEAD_SIZE + 4) {
        error!("descriptor checksum test failed");
        return Err(FirmwareError::DescriptorChecksumMismatch);
    }
    Ok(true)
}

/// Validate a firmware image and distill it into [`Capabilities`].
///
/// Runs once, synchronously, before interrupts are enabled. Every rule in
/// here is mandatory; the image is rejected outright rather than partially
/// trusted.
pub fn parse_firmware(image: &[u8]) -> FirmwareResult<Capabilities> {
    if image.len() <= FW_MIN_SIZE || image.len() > FW_MAX_SIZE {
        error!("firmware size is out of bounds: {}", image.len());
        return Err(FirmwareError::ImageSize);
    }
    let chain_offset = find_desc_chain(image).ok_or(FirmwareError::DescriptorChainNotFound)?;
    let chain = &image[chain_offset..];
    verify_desc_chain(chain)?;

    let checksum_protected = verify_checksum(image, chain_offset)?;

    let otus_offset = find_desc(chain, OTUS_MAGIC, OTUS_DESC_SIZE, OTUS_DESC_CUR_VER)
        .ok_or(FirmwareError::MissingCapabilityDescriptor)?;
    let otus = &chain[otus_offset..otus_offset + OTUS_DESC_SIZE];

    let features = FirmwareFeatures::from_bits(read_le32(otus, 8));
    let fw_address = read_le32(otus, 12);
    let beacon_address = read_le32(otus, 16);
    let beacon_max_len = read_le16(otus, 20);
    let miniboot_size = read_le16(otus, 22);
    let mem_block_size = read_le16(otus, 24);
    let rx_buffer_size = read_le16(otus, 26);
    let tx_descs = otus[28];
    let cmd_buffer_count = otus[29];
    let api_version = otus[30];
    let vif_count = otus[31];

    if !features.dummy() {
        error!("invalid firmware descriptor format detected");
        return Err(FirmwareError::InvalidDescriptorFormat);
    }
    if !(API_MIN_VER..=API_MAX_VER).contains(&api_version) {
        error!("unsupported firmware api version {}", api_version);
        return Err(FirmwareError::UnsupportedApiVersion {
            version: api_version,
        });
    }
    if !features.command_phy() || features.unusable() || !features.handle_back_req() {
        error!("firmware does not support mandatory features");
        return Err(FirmwareError::MissingMandatoryFeatures);
    }
    if !features.usb_init_firmware() {
        error!("firmware does not provide mandatory interfaces");
        return Err(FirmwareError::MissingMandatoryInterfaces);
    }
    if features.into_bits() != 0 && 31 - features.into_bits().leading_zeros() >= FEATURE_NUM {
        warn!("driver does not support all firmware features");
    }
    if !features.command_cam() {
        debug!("crypto offloading is disabled by firmware");
    }

    let mem_block_count = tx_descs.min(0xfe);
    if vif_count >= MAX_VIRTUAL_MAC
        || vif_count == 0
        || mem_block_count < 16
        || cmd_buffer_count == 0
        || mem_block_size < 64
        || mem_block_size > 512
        || rx_buffer_size > 32768
        || rx_buffer_size < 4096
        || !valid_cpu_addr(fw_address)
    {
        error!("firmware shows obvious signs of malicious tampering");
        return Err(FirmwareError::TamperedMemoryLayout);
    }

    let adhoc_beaconing = valid_dma_addr(beacon_address) && beacon_max_len >= BCN_LENGTH_MAX;

    let tx_seq_table = match find_desc(chain, TXSQ_MAGIC, TXSQ_DESC_SIZE, TXSQ_DESC_CUR_VER) {
        Some(offset) => {
            let addr = read_le32(chain, offset + DESC_HEAD_SIZE);
            if !valid_cpu_addr(addr) {
                return Err(FirmwareError::InvalidSequenceTableAddress);
            }
            Some(addr)
        }
        None => None,
    };

    let release = find_desc(chain, MOTD_MAGIC, MOTD_DESC_SIZE, MOTD_DESC_CUR_VER).map(|offset| {
        let start = offset + DESC_HEAD_SIZE + 4 + MOTD_STRING_LEN;
        let raw = &chain[start..start + MOTD_RELEASE_LEN];
        let text = raw.split(|&b| b == 0).next().unwrap_or(raw);
        let mut release = String::new();
        if let Ok(text) = core::str::from_utf8(text) {
            let _ = release.push_str(text);
        }
        release
    });
    if let Some(release) = &release {
        info!("firmware release {}", release.as_str());
    }

    Ok(Capabilities {
        features,
        api_version,
        vif_count,
        cmd_buffer_count,
        mem_block_count,
        mem_block_size,
        rx_buffer_size,
        firmware_address: fw_address,
        beacon_address,
        beacon_max_len,
        miniboot_offset: if features.miniboot() { miniboot_size } else { 0 },
        rx_stream: features.usb_up_stream(),
        tx_stream: features.usb_down_stream(),
        rx_filter: features.rx_filter(),
        hw_counters: features.hw_counters(),
        ba_filter: features.rx_ba_filter(),
        power_save: features.psm() && features.fixed_5ghz_psm(),
        disable_offload: !features.command_cam(),
        adhoc_beaconing,
        tx_seq_table,
        checksum_protected,
        release,
    })
}
