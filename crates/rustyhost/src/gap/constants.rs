// Address types as carried in HCI events and SMP identity frames
pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;
pub const PUBLIC_IDENTITY_ADDRESS: u8 = 0x02;
pub const RANDOM_IDENTITY_ADDRESS: u8 = 0x03;
/// No address provided (anonymous advertising)
pub const ANONYMOUS_ADDRESS: u8 = 0xFF;

// Two most significant bits of a random address
pub const RANDOM_ADDR_TYPE_MASK: u8 = 0xC0;
pub const RANDOM_ADDR_STATIC: u8 = 0xC0;
pub const RANDOM_ADDR_RESOLVABLE: u8 = 0x40;
pub const RANDOM_ADDR_NON_RESOLVABLE: u8 = 0x00;
