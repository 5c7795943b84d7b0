//! Debug Module registers, as seen over the DMI.

use bitfield::bitfield;

/// A register of the Debug Module.
pub trait DebugRegister: Into<u32> + From<u32> {
    /// DMI address of the register.
    const ADDRESS: u8;
    /// Name used in log messages.
    const NAME: &'static str;
}

macro_rules! debug_register {
    ($i:ident, $addr:expr, $name:expr) => {
        impl DebugRegister for $i {
            const ADDRESS: u8 = $addr;
            const NAME: &'static str = $name;
        }

        impl From<$i> for u32 {
            fn from(register: $i) -> Self {
                register.0
            }
        }

        impl From<u32> for $i {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }
    };
}

macro_rules! data_register {
    ($i:ident, $addr:expr, $name:expr) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        #[doc = concat!("`", $name, "` register.")]
        pub struct $i(pub u32);

        debug_register!($i, $addr, $name);
    };
}

/// Address of `data0`. `dataN` lives at `DATA0_ADDRESS + N`.
pub const DATA0_ADDRESS: u8 = 0x04;
/// Address of `progbuf0`. `progbufN` lives at `PROGBUF0_ADDRESS + N`.
pub const PROGBUF0_ADDRESS: u8 = 0x20;
/// Number of `progbuf` registers the DMI can address.
pub const PROGBUF_MAX: usize = 16;
/// Number of `data` registers the DMI can address.
pub const DATA_MAX: usize = 12;

bitfield! {
    /// `dmcontrol` register, located at address 0x10
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dmcontrol(u32);
    impl Debug;

    pub haltreq, set_haltreq: 31;
    pub resumereq, set_resumereq: 30;
    pub hartreset, set_hartreset: 29;
    pub ackhavereset, set_ackhavereset: 28;
    pub ackunavail, set_ackunavail: 27;
    pub hasel, set_hasel: 26;
    pub hartsello, set_hartsello: 25, 16;
    pub hartselhi, set_hartselhi: 15, 6;
    pub setkeepalive, set_setkeepalive: 5;
    pub clrkeepalive, set_clrkeepalive: 4;
    pub setresethaltreq, set_setresethaltreq: 3;
    pub clrresethaltreq, set_clrresethaltreq: 2;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

impl Dmcontrol {
    /// Currently selected hart, combining `hartselhi` and `hartsello`.
    pub fn hartsel(&self) -> u32 {
        self.hartselhi() << 10 | self.hartsello()
    }

    /// Select a hart, splitting the index into `hartselhi` and `hartsello`.
    pub fn set_hartsel(&mut self, value: u32) {
        self.set_hartsello(value & 0x3ff);
        self.set_hartselhi((value >> 10) & 0x3ff);
    }
}

debug_register!(Dmcontrol, 0x10, "dmcontrol");

bitfield! {
    /// Readonly `dmstatus` register.
    ///
    /// Located at address 0x11
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dmstatus(u32);
    impl Debug;

    pub ndmresetpending, _: 24;
    pub stickyunavail, _: 23;
    pub impebreak, _: 22;
    pub allhavereset, _: 19;
    pub anyhavereset, _: 18;
    pub allresumeack, _: 17;
    pub anyresumeack, _: 16;
    pub allnonexistent, _: 15;
    pub anynonexistent, _: 14;
    pub allunavail, _: 13;
    pub anyunavail, _: 12;
    pub allrunning, _: 11;
    pub anyrunning, _: 10;
    pub allhalted, _: 9;
    pub anyhalted, _: 8;
    pub authenticated, _: 7;
    pub authbusy, _: 6;
    pub hasresethaltreq, _: 5;
    pub confstrptrvalid, _: 4;
    pub version, _: 3, 0;
}

debug_register!(Dmstatus, 0x11, "dmstatus");

bitfield! {
    /// `hartinfo` register, describing the data registers shadowed in hart memory.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Hartinfo(u32);
    impl Debug;

    pub nscratch, _: 23, 20;
    pub dataaccess, _: 16;
    pub datasize, _: 15, 12;
    pub dataaddr, _: 11, 0;
}

debug_register!(Hartinfo, 0x12, "hartinfo");

data_register!(Haltsum1, 0x13, "haltsum1");

bitfield! {
    /// `hawindowsel` register.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Hawindowsel(u32);
    impl Debug;

    pub hawindowsel, set_hawindowsel: 14, 0;
}

debug_register!(Hawindowsel, 0x14, "hawindowsel");

data_register!(Hawindow, 0x15, "hawindow");

bitfield! {
    /// `abstractcs` register.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Abstractcs(u32);
    impl Debug;

    pub progbufsize, _: 28, 24;
    pub busy, _: 12;
    pub relaxedpriv, set_relaxedpriv: 11;
    pub cmderr, set_cmderr: 10, 8;
    pub datacount, _: 3, 0;
}

debug_register!(Abstractcs, 0x16, "abstractcs");

data_register!(Command, 0x17, "command");

bitfield! {
    /// `abstractauto` register.
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct Abstractauto(u32);
    impl Debug;

    pub autoexecprogbuf, set_autoexecprogbuf: 31, 16;
    pub autoexecdata, set_autoexecdata: 11, 0;
}

debug_register!(Abstractauto, 0x18, "abstractauto");

data_register!(Data0, 0x04, "data0");
data_register!(Data1, 0x05, "data1");
data_register!(Data2, 0x06, "data2");
data_register!(Data3, 0x07, "data3");

data_register!(Authdata, 0x30, "authdata");

bitfield! {
    /// `dmcs2` register, controlling halt group membership.
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct Dmcs2(u32);
    impl Debug;

    pub grouptype, set_grouptype: 11;
    pub dmexttrigger, set_dmexttrigger: 10, 7;
    pub group, set_group: 6, 2;
    pub hgwrite, set_hgwrite: 1;
    pub hgselect, set_hgselect: 0;
}

debug_register!(Dmcs2, 0x32, "dmcs2");

data_register!(Haltsum2, 0x34, "haltsum2");
data_register!(Haltsum3, 0x35, "haltsum3");

bitfield! {
    /// System bus access control and status.
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct Sbcs(u32);
    impl Debug;

    pub sbversion, _: 31, 29;
    pub sbbusyerror, set_sbbusyerror: 22;
    pub sbbusy, _: 21;
    pub sbreadonaddr, set_sbreadonaddr: 20;
    pub sbaccess, set_sbaccess: 19, 17;
    pub sbautoincrement, set_sbautoincrement: 16;
    pub sbreadondata, set_sbreadondata: 15;
    pub sberror, set_sberror: 14, 12;
    pub sbasize, _: 11, 5;
    pub sbaccess128, _: 4;
    pub sbaccess64, _: 3;
    pub sbaccess32, _: 2;
    pub sbaccess16, _: 1;
    pub sbaccess8, _: 0;
}

impl Sbcs {
    /// Whether the system bus supports accesses of `size` bytes.
    pub fn supports_size(&self, size: usize) -> bool {
        match size {
            1 => self.sbaccess8(),
            2 => self.sbaccess16(),
            4 => self.sbaccess32(),
            8 => self.sbaccess64(),
            16 => self.sbaccess128(),
            _ => false,
        }
    }
}

debug_register!(Sbcs, 0x38, "sbcs");

data_register!(Sbaddress3, 0x37, "sbaddress3");
data_register!(Sbaddress0, 0x39, "sbaddress0");
data_register!(Sbaddress1, 0x3a, "sbaddress1");
data_register!(Sbaddress2, 0x3b, "sbaddress2");
data_register!(Sbdata0, 0x3c, "sbdata0");
data_register!(Sbdata1, 0x3d, "sbdata1");
data_register!(Sbdata2, 0x3e, "sbdata2");
data_register!(Sbdata3, 0x3f, "sbdata3");

data_register!(Haltsum0, 0x40, "haltsum0");

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hartsel_is_split_into_hi_and_lo() {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_hartsel(0x4_02);

        assert_eq!(dmcontrol.hartsello(), 0x002);
        assert_eq!(dmcontrol.hartselhi(), 0x1);
        assert_eq!(dmcontrol.hartsel(), 0x402);
    }

    #[test]
    fn abstractcs_fields() {
        let abstractcs = Abstractcs(0x0400_0702);

        assert_eq!(abstractcs.progbufsize(), 4);
        assert_eq!(abstractcs.cmderr(), 7);
        assert_eq!(abstractcs.datacount(), 2);
        assert!(!abstractcs.busy());
    }
}
