//! Scan-then-apply tests against small synthetic inputs: the allocation decisions, the dynamic
//! relocation records, and the bytes the apply pass produces.

use librivet::Applier;
use librivet::Args;
use librivet::SectionApplyTask;
use librivet::DiagnosticSink;
use librivet::OutputKind;
use librivet::RelocationModel;
use librivet::Scanner;
use librivet::input::ImageLayout;
use librivet::input::InputObject;
use librivet::input::Relocation;
use librivet::input::SectionInfo;
use librivet::input::SectionKey;
use librivet::symbol_facts::GotSlotKind;
use librivet::symbol_facts::SymbolFacts;
use librivet::symbol_facts::ValueFlags;
use librivet::x86_64::X86_64;
use rivet_utils::elf::SectionFlags;
use rivet_utils::elf::shf;
use std::num::NonZeroU32;

const TEXT_FLAGS: SectionFlags = shf::ALLOC.with(shf::EXECINSTR);
const DATA_FLAGS: SectionFlags = shf::ALLOC.with(shf::WRITE);

fn test_object(facts: &mut SymbolFacts, symbol_count: usize) -> InputObject {
    let symbol_id_range = facts.add_object_symbols("test.o", symbol_count);
    InputObject {
        name: "test.o".to_owned(),
        file_id: 0,
        symbol_id_range,
    }
}

fn test_layout() -> ImageLayout {
    ImageLayout {
        got_address: 0x3000,
        plt_address: 0x2000,
        dynamic_section_address: Some(0x5000),
        tls: Some(0x4000..0x4100),
        section_addresses: vec![(
            SectionKey {
                file_id: 0,
                section_index: 0,
            },
            0x1000,
        )],
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// One absolute 64-bit relocation against an imported global in position-independent output: the
/// symbol gets a GOT slot with a GLOB_DAT relocation, no PLT entry, and the site is left zero for
/// the loader.
#[test]
fn absolute_reference_to_imported_symbol_in_pie() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::Relocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let imported = facts.add_symbol(Some("imported"), ValueFlags::DYNAMIC);
    facts.set_dynamic_symbol_index(imported, NonZeroU32::new(1).unwrap());
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), imported);

    let data = [0u8; 8];
    let section = SectionInfo {
        index: 0,
        flags: DATA_FLAGS,
        data: &data,
    };
    let relocations = [Relocation {
        r_type: object::elf::R_X86_64_64,
        offset: 0,
        symbol: 0,
        addend: 0,
    }];

    let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let scan = scanner.finish().unwrap();
    assert!(!diagnostics.has_errors());

    assert_eq!(scan.plt().regular_entry_count(), 0);
    assert_eq!(scan.plt().irelative_entry_count(), 0);
    assert_eq!(scan.dynamic_relocations().regular_count(), 1);

    let slot = scan.facts().got_ref(imported, GotSlotKind::Standard).unwrap();
    let slot_offset = scan.got().offset_of(slot);

    let layout = test_layout();
    let applier = Applier::new(&scan, &layout, &diagnostics);

    let mut out = data;
    applier
        .apply_relocations(&object, &section, &relocations, &mut out)
        .unwrap();
    assert!(!diagnostics.has_errors());
    assert_eq!(read_u64(&out, 0), 0, "the loader fills the site");

    let mut rela = vec![0u8; scan.dynamic_relocations().size_in_bytes::<X86_64>() as usize];
    applier.write_dynamic_relocations(&mut rela).unwrap();
    assert_eq!(read_u64(&rela, 0), layout.got_address + slot_offset);
    let r_info = read_u64(&rela, 8);
    assert_eq!(r_info as u32, object::elf::R_X86_64_GLOB_DAT);
    assert_eq!((r_info >> 32) as u32, 1, "dynamic symbol index");
    assert_eq!(read_u64(&rela, 16) as i64, 0);
}

/// A call to a locally-defined, non-preemptible function needs no trampoline: the field is the
/// direct PC-relative distance.
#[test]
fn call_to_local_function_bypasses_plt() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let callee = facts.add_symbol(
        Some("callee"),
        ValueFlags::NON_INTERPOSABLE | ValueFlags::FUNCTION,
    );
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), callee);

    // call callee
    let data = [0xe8, 0, 0, 0, 0];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [Relocation {
        r_type: object::elf::R_X86_64_PLT32,
        offset: 1,
        symbol: 0,
        addend: -4,
    }];

    let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let mut scan = scanner.finish().unwrap();

    assert_eq!(scan.plt().regular_entry_count(), 0);
    assert_eq!(scan.dynamic_relocations().total_count(), 0);

    scan.facts_mut().define_symbol_value(callee, 0x2000);

    let layout = test_layout();
    let applier = Applier::new(&scan, &layout, &diagnostics);
    let mut out = data;
    applier
        .apply_relocations(&object, &section, &relocations, &mut out)
        .unwrap();
    assert!(!diagnostics.has_errors());

    // 0x2000 - (0x1001 + 4): the usual end-of-instruction convention via the -4 addend.
    assert_eq!(read_u32(&out, 1) as i32, 0x2000 - 0x1005);
}

/// A call to an undefined symbol gets the first regular PLT entry (index 0, after the reserved
/// resolver), a jump slot pointing back into that entry, and a JUMP_SLOT dynamic relocation.
#[test]
fn call_to_undefined_symbol_creates_plt_entry() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let undefined = facts.add_symbol(Some("undefined"), ValueFlags::UNDEFINED);
    facts.set_dynamic_symbol_index(undefined, NonZeroU32::new(3).unwrap());
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), undefined);

    let data = [0xe8, 0, 0, 0, 0];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [Relocation {
        r_type: object::elf::R_X86_64_PLT32,
        offset: 1,
        symbol: 0,
        addend: -4,
    }];

    let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let scan = scanner.finish().unwrap();
    assert!(!diagnostics.has_errors());

    assert_eq!(scan.plt().regular_entry_count(), 1);
    let plt_ref = scan.facts().plt_ref(undefined).unwrap();
    assert_eq!(
        scan.plt().offset_of(plt_ref),
        scan.first_plt_entry_offset(),
        "first regular slot, after the reserved resolver"
    );

    let layout = test_layout();
    let applier = Applier::new(&scan, &layout, &diagnostics);

    // The call goes through the PLT entry.
    let mut out = data;
    applier
        .apply_relocations(&object, &section, &relocations, &mut out)
        .unwrap();
    let plt_entry_address = layout.plt_address + scan.plt().offset_of(plt_ref);
    assert_eq!(
        i64::from(read_u32(&out, 1) as i32),
        plt_entry_address as i64 - 4 - 0x1001
    );

    // The jump slot resumes lazy resolution inside the entry (just past the initial jmp).
    let slot = scan.facts().got_ref(undefined, GotSlotKind::Standard);
    assert!(slot.is_none(), "jump slots are not address-equality slots");
    let mut got = vec![0u8; scan.got().size_in_bytes() as usize];
    applier.write_got(&mut got).unwrap();
    let jump_slot_offset = scan.got().base_offset() + 3 * 8;
    assert_eq!(
        read_u64(&got, jump_slot_offset as usize),
        plt_entry_address + 6
    );

    // Exactly one JUMP_SLOT dynamic relocation targets the jump slot.
    assert_eq!(scan.dynamic_relocations().regular_count(), 1);
    let mut rela = vec![0u8; scan.dynamic_relocations().size_in_bytes::<X86_64>() as usize];
    applier.write_dynamic_relocations(&mut rela).unwrap();
    assert_eq!(read_u64(&rela, 0), layout.got_address + jump_slot_offset);
    let r_info = read_u64(&rela, 8);
    assert_eq!(r_info as u32, object::elf::R_X86_64_JUMP_SLOT);
    assert_eq!((r_info >> 32) as u32, 3);

    // The resolver stub's first patch points at GOT base + 8.
    let mut plt = vec![0u8; scan.plt().size_in_bytes() as usize];
    applier.write_plt(&mut plt).unwrap();
    let got_base_address = layout.got_address + scan.got().base_offset();
    let disp = read_u32(&plt, 2) as i32 as i64;
    assert_eq!(
        layout.plt_address as i64 + 6 + disp,
        got_base_address as i64 + 8
    );
}

fn gd_sequence() -> [u8; 16] {
    [
        0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, // data16 lea x@tlsgd(%rip),%rdi
        0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0, // data16 data16 rex.W call __tls_get_addr
    ]
}

fn le_sequence() -> [u8; 16] {
    [
        0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0,%rax
        0x48, 0x8d, 0x80, 0, 0, 0, 0, // lea x@tpoff(%rax),%rax
    ]
}

/// Encoding a general-dynamic access to a link-time-resolved variable in an executable must
/// produce bytes bit-identical to directly encoding the local-exec form of the same access.
#[test]
fn gd_to_local_exec_round_trip_matches_direct_local_exec() {
    let run = |data: [u8; 16], relocations: &[Relocation]| -> [u8; 16] {
        let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable));
        let diagnostics = DiagnosticSink::new();

        let mut facts = SymbolFacts::new();
        let tls_var = facts.add_symbol(Some("tls_var"), ValueFlags::NON_INTERPOSABLE);
        let object = test_object(&mut facts, 1);
        facts.set_definition(object.symbol_id_range.input_to_id(0), tls_var);

        let section = SectionInfo {
            index: 0,
            flags: TEXT_FLAGS,
            data: &data,
        };
        let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
        scanner
            .scan_relocations(&object, &section, relocations)
            .unwrap();
        let mut scan = scanner.finish().unwrap();
        assert!(!diagnostics.has_errors());

        // Nothing survives the downgrade: no TLS GOT slots, no dynamic relocations.
        assert_eq!(scan.got().entry_count(), 3, "only the .got.plt header");
        assert_eq!(scan.dynamic_relocations().total_count(), 0);

        scan.facts_mut().define_symbol_value(tls_var, 0x4010);
        let layout = test_layout();
        let applier = Applier::new(&scan, &layout, &diagnostics);
        let mut out = data;
        applier
            .apply_relocations(&object, &section, relocations, &mut out)
            .unwrap();
        assert!(!diagnostics.has_errors());
        out
    };

    let via_gd = run(
        gd_sequence(),
        &[
            Relocation {
                r_type: object::elf::R_X86_64_TLSGD,
                offset: 4,
                symbol: 0,
                addend: -4,
            },
            // The call the rewrite consumes.
            Relocation {
                r_type: object::elf::R_X86_64_PLT32,
                offset: 12,
                symbol: 0,
                addend: -4,
            },
        ],
    );

    let direct_le = run(
        le_sequence(),
        &[Relocation {
            r_type: object::elf::R_X86_64_TPOFF32,
            offset: 12,
            symbol: 0,
            addend: 0,
        }],
    );

    assert_eq!(via_gd, direct_le);

    // Both carry tpoff = 0x4010 - 0x4100.
    let tpoff = read_u32(&via_gd, 12) as i32;
    assert_eq!(i64::from(tpoff), 0x4010 - 0x4100);
}

/// A general-dynamic access to a preemptible symbol in a shared object is left alone: the pair is
/// allocated, with module and offset relocations against the symbol.
#[test]
fn gd_in_shared_object_allocates_pair() {
    let args = Args::new(OutputKind::SharedObject);
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let tls_var = facts.add_symbol(Some("tls_var"), ValueFlags::empty());
    facts.set_dynamic_symbol_index(tls_var, NonZeroU32::new(2).unwrap());
    let tls_get_addr = facts.add_symbol(
        Some("__tls_get_addr"),
        ValueFlags::DYNAMIC | ValueFlags::FUNCTION,
    );
    facts.set_dynamic_symbol_index(tls_get_addr, NonZeroU32::new(3).unwrap());
    let object = test_object(&mut facts, 2);
    facts.set_definition(object.symbol_id_range.input_to_id(0), tls_var);
    facts.set_definition(object.symbol_id_range.input_to_id(1), tls_get_addr);

    let data = gd_sequence();
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [
        Relocation {
            r_type: object::elf::R_X86_64_TLSGD,
            offset: 4,
            symbol: 0,
            addend: -4,
        },
        // With no downgrade possible, the call to __tls_get_addr survives and gets a PLT entry.
        Relocation {
            r_type: object::elf::R_X86_64_PLT32,
            offset: 12,
            symbol: 1,
            addend: -4,
        },
    ];

    let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let scan = scanner.finish().unwrap();
    assert!(!diagnostics.has_errors());

    // Header + module/offset pair + __tls_get_addr's jump slot.
    assert_eq!(scan.got().entry_count(), 6);
    // DTPMOD + DTPOFF for the variable, JUMP_SLOT for the call.
    assert_eq!(scan.dynamic_relocations().regular_count(), 3);
    assert_eq!(scan.plt().regular_entry_count(), 1);
    assert!(
        scan.facts()
            .got_ref(tls_var, GotSlotKind::TlsPair)
            .is_some()
    );
}

/// Allocator idempotence across two sections referencing the same symbol: one GOT slot, one
/// GLOB_DAT.
#[test]
fn repeated_references_share_one_slot() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::Relocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let imported = facts.add_symbol(Some("imported"), ValueFlags::DYNAMIC);
    facts.set_dynamic_symbol_index(imported, NonZeroU32::new(1).unwrap());
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), imported);

    // mov imported@GOTPCREL(%rip),%rax  (twice)
    let data = [0x48, 0x8b, 0x05, 0, 0, 0, 0, 0x48, 0x8b, 0x05, 0, 0, 0, 0];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [
        Relocation {
            r_type: object::elf::R_X86_64_GOTPCREL,
            offset: 3,
            symbol: 0,
            addend: -4,
        },
        Relocation {
            r_type: object::elf::R_X86_64_GOTPCREL,
            offset: 10,
            symbol: 0,
            addend: -4,
        },
    ];

    let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let scan = scanner.finish().unwrap();
    assert!(!diagnostics.has_errors());

    assert_eq!(scan.got().entry_count(), 4, ".got.plt header + one slot");
    assert_eq!(scan.dynamic_relocations().regular_count(), 1);
}

/// An unknown relocation type is reported against the object and scanning continues.
#[test]
fn unsupported_relocation_is_reported_and_scanning_continues() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let callee = facts.add_symbol(
        Some("callee"),
        ValueFlags::NON_INTERPOSABLE | ValueFlags::FUNCTION,
    );
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), callee);

    let data = [0xe8, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [
        Relocation {
            r_type: 0xdead,
            offset: 1,
            symbol: 0,
            addend: -4,
        },
        Relocation {
            r_type: object::elf::R_X86_64_PLT32,
            offset: 6,
            symbol: 0,
            addend: -4,
        },
    ];

    let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let scan = scanner.finish().unwrap();

    assert_eq!(diagnostics.error_count(), 1);
    // The second relocation was still processed.
    assert_eq!(scan.dynamic_relocations().total_count(), 0);
}

/// A relocation type that only the dynamic loader should ever produce is a distinct error.
#[test]
fn runtime_only_relocation_is_rejected() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let sym = facts.add_symbol(Some("x"), ValueFlags::NON_INTERPOSABLE);
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), sym);

    let data = [0u8; 8];
    let section = SectionInfo {
        index: 0,
        flags: DATA_FLAGS,
        data: &data,
    };
    let relocations = [Relocation {
        r_type: object::elf::R_X86_64_GLOB_DAT,
        offset: 0,
        symbol: 0,
        addend: 0,
    }];

    let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    drop(scanner.finish().unwrap());

    let errors = diagnostics.take_errors();
    assert_eq!(errors.len(), 1);
    assert!(
        errors[0]
            .downcast_ref::<librivet::error::UnexpectedRuntimeRelocation>()
            .is_some()
    );
}

/// Local ifuncs referenced by a call end up in the IRELATIVE sub-table, after all regular
/// entries, with their relocation in the IRELATIVE list.
#[test]
fn ifunc_call_uses_irelative_sub_table() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let imported_fn = facts.add_symbol(Some("imported_fn"), ValueFlags::DYNAMIC | ValueFlags::FUNCTION);
    facts.set_dynamic_symbol_index(imported_fn, NonZeroU32::new(5).unwrap());
    let resolver = facts.add_symbol(
        Some("my_ifunc"),
        ValueFlags::NON_INTERPOSABLE | ValueFlags::IFUNC | ValueFlags::FUNCTION,
    );
    let object = test_object(&mut facts, 2);
    facts.set_definition(object.symbol_id_range.input_to_id(0), imported_fn);
    facts.set_definition(object.symbol_id_range.input_to_id(1), resolver);

    let data = [0xe8, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [
        Relocation {
            r_type: object::elf::R_X86_64_PLT32,
            offset: 1,
            symbol: 0,
            addend: -4,
        },
        Relocation {
            r_type: object::elf::R_X86_64_PLT32,
            offset: 6,
            symbol: 1,
            addend: -4,
        },
    ];

    let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let scan = scanner.finish().unwrap();
    assert!(!diagnostics.has_errors());

    assert_eq!(scan.plt().regular_entry_count(), 1);
    assert_eq!(scan.plt().irelative_entry_count(), 1);
    assert_eq!(scan.dynamic_relocations().regular_count(), 1);
    assert_eq!(scan.dynamic_relocations().irelative_count(), 1);

    // The IRELATIVE entry sits strictly after the regular entry.
    let regular_offset = scan.plt().offset_of(scan.facts().plt_ref(imported_fn).unwrap());
    let irelative_offset = scan.plt().offset_of(scan.facts().plt_ref(resolver).unwrap());
    assert!(irelative_offset > regular_offset);
    assert_eq!(irelative_offset, 2 * scan.plt_entry_size());

    // Emission order: the JUMP_SLOT record comes before the IRELATIVE record.
    let mut scan = scan;
    scan.facts_mut().define_symbol_value(resolver, 0x1800);
    let layout = test_layout();
    let applier = Applier::new(&scan, &layout, &diagnostics);
    let mut rela = vec![0u8; scan.dynamic_relocations().size_in_bytes::<X86_64>() as usize];
    applier.write_dynamic_relocations(&mut rela).unwrap();
    assert_eq!(read_u64(&rela, 8) as u32, object::elf::R_X86_64_JUMP_SLOT);
    assert_eq!(read_u64(&rela, 32) as u32, object::elf::R_X86_64_IRELATIVE);
    // The IRELATIVE addend is the resolver's address.
    assert_eq!(read_u64(&rela, 40), 0x1800);
}

/// Sections are independent once scanning is done: the parallel driver produces the same bytes
/// as applying them one by one.
#[test]
fn sections_apply_independently_in_parallel() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let target = facts.add_symbol(Some("target"), ValueFlags::NON_INTERPOSABLE);
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), target);

    let text_a = [0xe8, 0, 0, 0, 0];
    let text_b = [0xe8, 0, 0, 0, 0];
    let section_a = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &text_a,
    };
    let section_b = SectionInfo {
        index: 1,
        flags: TEXT_FLAGS,
        data: &text_b,
    };
    let relocations = [Relocation {
        r_type: object::elf::R_X86_64_PC32,
        offset: 1,
        symbol: 0,
        addend: -4,
    }];

    let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section_a, &relocations)
        .unwrap();
    scanner
        .scan_relocations(&object, &section_b, &relocations)
        .unwrap();
    let mut scan = scanner.finish().unwrap();
    scan.facts_mut().define_symbol_value(target, 0x9000);

    let mut layout = test_layout();
    layout.section_addresses.push((
        SectionKey {
            file_id: 0,
            section_index: 1,
        },
        0x1100,
    ));
    let applier = Applier::new(&scan, &layout, &diagnostics);

    let mut out_a = text_a;
    let mut out_b = text_b;
    let mut tasks = [
        SectionApplyTask {
            object: &object,
            section: section_a,
            relocations: &relocations,
            out: &mut out_a,
        },
        SectionApplyTask {
            object: &object,
            section: section_b,
            relocations: &relocations,
            out: &mut out_b,
        },
    ];
    applier.apply_sections(&mut tasks).unwrap();
    assert!(!diagnostics.has_errors());

    assert_eq!(read_u32(&out_a, 1) as i32, 0x9000 - 0x1005);
    assert_eq!(read_u32(&out_b, 1) as i32, 0x9000 - 0x1105);
}

/// An unoptimized TLS descriptor in a shared object: the pair lives in the dedicated GOT
/// sub-region, its relocation goes in the TLSDESC list (emitted last), and the reserved
/// TLS-descriptor resolver entry is the single last PLT entry.
#[test]
fn tls_descriptor_in_shared_object() {
    let args = Args::new(OutputKind::SharedObject);
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let tls_var = facts.add_symbol(Some("tls_var"), ValueFlags::empty());
    facts.set_dynamic_symbol_index(tls_var, NonZeroU32::new(2).unwrap());
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), tls_var);

    let data = [
        0x48, 0x8d, 0x05, 0, 0, 0, 0, // lea x@tlsdesc(%rip),%rax
        0xff, 0x10, // call *(%rax)
    ];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [
        Relocation {
            r_type: object::elf::R_X86_64_GOTPC32_TLSDESC,
            offset: 3,
            symbol: 0,
            addend: -4,
        },
        Relocation {
            r_type: object::elf::R_X86_64_TLSDESC_CALL,
            offset: 7,
            symbol: 0,
            addend: 0,
        },
    ];

    let mut scanner = Scanner::<X86_64>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let scan = scanner.finish().unwrap();
    assert!(!diagnostics.has_errors());

    assert_eq!(scan.dynamic_relocations().tlsdesc_count(), 1);
    // Reserved resolver entry + the reserved TLS-descriptor entry, nothing else.
    assert_eq!(scan.plt_entry_count(), 2);

    let layout = test_layout();
    let applier = Applier::new(&scan, &layout, &diagnostics);

    // The TLSDESC record is emitted after everything else and targets the descriptor pair.
    let mut rela = vec![0u8; scan.dynamic_relocations().size_in_bytes::<X86_64>() as usize];
    applier.write_dynamic_relocations(&mut rela).unwrap();
    let last = rela.len() - 24;
    let r_info = read_u64(&rela, last + 8);
    assert_eq!(r_info as u32, object::elf::R_X86_64_TLSDESC);
    assert_eq!((r_info >> 32) as u32, 2);
    let desc_slot = scan
        .facts()
        .got_ref(tls_var, GotSlotKind::TlsDesc)
        .unwrap();
    assert_eq!(
        read_u64(&rela, last),
        layout.got_address + scan.got().offset_of(desc_slot)
    );

    // The site points at the descriptor pair; the bytes were not rewritten.
    let mut out = data;
    applier
        .apply_relocations(&object, &section, &relocations, &mut out)
        .unwrap();
    assert!(!diagnostics.has_errors());
    assert_eq!(&out[..3], &data[..3]);
    let expected = (layout.got_address + scan.got().offset_of(desc_slot)) as i64 - 4 - 0x1003;
    assert_eq!(i64::from(read_u32(&out, 3) as i32), expected);
}
