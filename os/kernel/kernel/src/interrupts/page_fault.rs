use bitfield_struct::bitfield;

/// Page-fault error code pushed by the CPU (Intel SDM Vol. 3A, "Page-Fault
/// Exception (#PF)").
#[bitfield(u32)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool, // bit 0

    /// 0 = read or execute, 1 = write.
    pub write: bool, // bit 1

    /// 1 = the access happened at CPL 3.
    pub user: bool, // bit 2

    /// 1 = a reserved bit was set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch. Only reported with PAE/NX, never by plain
    /// two-level paging.
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    pub fn explain(&self) -> &'static str {
        match (self.present(), self.user(), self.write()) {
            _ if self.reserved_bit() => "Reserved bit set in a paging structure",
            (false, true, _) => "User access to an unmapped page",
            (false, false, _) => "Kernel access to an unmapped page",
            (true, true, true) => "User write to a read-only or supervisor page",
            (true, true, false) => "User read of a supervisor page",
            (true, false, true) => "Kernel write to a read-only page",
            (true, false, false) => "Kernel read on a protected page",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_common_user_faults() {
        let null_deref = PageFaultError::from_bits(0b100);
        assert!(null_deref.user());
        assert!(!null_deref.present());
        assert_eq!(null_deref.explain(), "User access to an unmapped page");

        let text_write = PageFaultError::from_bits(0b111);
        assert!(text_write.write());
        assert_eq!(text_write.explain(), "User write to a read-only or supervisor page");
    }

    #[test]
    fn kernel_faults_are_told_apart() {
        assert_eq!(
            PageFaultError::from_bits(0b010).explain(),
            "Kernel access to an unmapped page"
        );
        assert_eq!(
            PageFaultError::from_bits(0b011).explain(),
            "Kernel write to a read-only page"
        );
        assert_eq!(
            PageFaultError::from_bits(0b1001).explain(),
            "Reserved bit set in a paging structure"
        );
    }
}
