//! i386 flavours of the scan/apply flow: REL-format dynamic relocations, GOT-base-relative
//! addressing, the %ebx-relative trampolines, and the error taxonomy around TLS conventions.

use librivet::Applier;
use librivet::Args;
use librivet::DiagnosticSink;
use librivet::OutputKind;
use librivet::RelocationModel;
use librivet::Scanner;
use librivet::i386::I386;
use librivet::input::ImageLayout;
use librivet::input::InputObject;
use librivet::input::Relocation;
use librivet::input::SectionInfo;
use librivet::input::SectionKey;
use librivet::symbol_facts::GotSlotKind;
use librivet::symbol_facts::SymbolFacts;
use librivet::symbol_facts::ValueFlags;
use rivet_utils::elf::SectionFlags;
use rivet_utils::elf::shf;

const TEXT_FLAGS: SectionFlags = shf::ALLOC.with(shf::EXECINSTR);

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

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// A GOT32 reference to a locally-defined symbol in relocatable output: the slot sits below the
/// GOT base (negative offset), gets a RELATIVE relocation, and the record is 8 bytes of REL.
#[test]
fn got_reference_uses_negative_offset_from_base() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::Relocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let local = facts.add_symbol(Some("local_data"), ValueFlags::NON_INTERPOSABLE);
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), local);

    // movl x@GOT(%ebx),%eax
    let data = [0x8b, 0x83, 0, 0, 0, 0];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [Relocation {
        r_type: object::elf::R_386_GOT32,
        offset: 2,
        symbol: 0,
        addend: 0,
    }];

    let mut scanner = Scanner::<I386>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let mut scan = scanner.finish().unwrap();
    assert!(!diagnostics.has_errors());

    assert_eq!(scan.dynamic_relocations().regular_count(), 1);
    scan.facts_mut().define_symbol_value(local, 0x1800);

    let layout = test_layout();
    let applier = Applier::new(&scan, &layout, &diagnostics);

    let mut out = data;
    applier
        .apply_relocations(&object, &section, &relocations, &mut out)
        .unwrap();
    assert!(!diagnostics.has_errors());

    // One 4-byte slot below the base.
    let slot = scan.facts().got_ref(local, GotSlotKind::Standard).unwrap();
    assert_eq!(scan.got().offset_of(slot), 0);
    assert_eq!(scan.got().base_offset(), 4);
    assert_eq!(read_u32(&out, 2) as i32, -4);

    // REL record: 8 bytes, offset + info only.
    assert_eq!(
        scan.dynamic_relocations().size_in_bytes::<I386>(),
        8,
        "REL records carry no explicit addend"
    );
    let mut rel = vec![0u8; 8];
    applier.write_dynamic_relocations(&mut rel).unwrap();
    assert_eq!(u64::from(read_u32(&rel, 0)), layout.got_address);
    assert_eq!(read_u32(&rel, 4), object::elf::R_386_RELATIVE);

    // The implicit addend is the slot's own content: the symbol's link-time address.
    let mut got = vec![0u8; scan.got().size_in_bytes() as usize];
    applier.write_got(&mut got).unwrap();
    assert_eq!(read_u32(&got, 0), 0x1800);
}

/// The relocatable-output trampoline is fully %ebx-relative: its resolver stub needs no link-time
/// patches at all, and the entry addresses its jump slot by GOT offset.
#[test]
fn pic_plt_uses_ebx_relative_form() {
    let args = Args::new(OutputKind::SharedObject);
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let imported = facts.add_symbol(
        Some("imported"),
        ValueFlags::DYNAMIC | ValueFlags::FUNCTION,
    );
    facts.set_dynamic_symbol_index(imported, std::num::NonZeroU32::new(1).unwrap());
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), imported);

    let data = [0xe8, 0, 0, 0, 0];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [Relocation {
        r_type: object::elf::R_386_PLT32,
        offset: 1,
        symbol: 0,
        addend: -4,
    }];

    let mut scanner = Scanner::<I386>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let scan = scanner.finish().unwrap();
    assert!(!diagnostics.has_errors());
    assert_eq!(scan.plt().regular_entry_count(), 1);

    let layout = test_layout();
    let applier = Applier::new(&scan, &layout, &diagnostics);
    let mut plt = vec![0u8; scan.plt().size_in_bytes() as usize];
    applier.write_plt(&mut plt).unwrap();

    // pushl 4(%ebx); jmp *8(%ebx): the stub is position-independent as-is.
    assert_eq!(&plt[..12], &[0xff, 0xb3, 4, 0, 0, 0, 0xff, 0xa3, 8, 0, 0, 0]);

    // The entry's first field is the jump slot's offset from the GOT base.
    let jump_slot_offset_from_base = 3 * 4;
    assert_eq!(&plt[16..18], &[0xff, 0xa3]);
    assert_eq!(read_u32(&plt, 18), jump_slot_offset_from_base);
}

/// Mixing the Sun and GNU local-dynamic conventions in one section is a model conflict; a pure
/// Sun-model section is merely unsupported.
#[test]
fn sun_and_gnu_tls_models_conflict() {
    let args = Args::new(OutputKind::SharedObject);
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let tls_var = facts.add_symbol(Some("tls_var"), ValueFlags::NON_INTERPOSABLE);
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), tls_var);

    // leal x(%ebx),%eax twice; the bytes only matter for the GNU relocation.
    let data = [0x8d, 0x83, 0, 0, 0, 0, 0x8d, 0x83, 0, 0, 0, 0];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [
        Relocation {
            r_type: object::elf::R_386_TLS_LDM,
            offset: 2,
            symbol: 0,
            addend: 0,
        },
        Relocation {
            r_type: object::elf::R_386_TLS_LDM_32,
            offset: 8,
            symbol: 0,
            addend: 0,
        },
    ];

    let mut scanner = Scanner::<I386>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    drop(scanner.finish().unwrap());

    let errors = diagnostics.take_errors();
    assert!(
        errors
            .iter()
            .any(|e| e.downcast_ref::<librivet::error::TlsModelConflict>().is_some()),
        "expected a TLS model conflict, got: {errors:?}"
    );
}

/// A TLS sequence that must be rewritten but doesn't match any known opcode pattern is a hard
/// error: the input wasn't produced by a supported compiler.
#[test]
fn unrecognised_tls_sequence_is_a_pattern_mismatch() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let tls_var = facts.add_symbol(Some("tls_var"), ValueFlags::NON_INTERPOSABLE);
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), tls_var);

    // Not a general-dynamic sequence at all.
    let data = [0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [Relocation {
        r_type: object::elf::R_386_TLS_GD,
        offset: 2,
        symbol: 0,
        addend: 0,
    }];

    let mut scanner = Scanner::<I386>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    drop(scanner.finish().unwrap());

    let errors = diagnostics.take_errors();
    assert_eq!(errors.len(), 1);
    assert!(
        errors[0]
            .downcast_ref::<librivet::error::OpcodePatternMismatch>()
            .is_some()
    );
}

/// i386 GD to local-exec: the rewritten field carries the negated static TLS offset consumed by
/// `subl`.
#[test]
fn gd_to_local_exec_writes_negated_offset() {
    let args = Args::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable));
    let diagnostics = DiagnosticSink::new();

    let mut facts = SymbolFacts::new();
    let tls_var = facts.add_symbol(Some("tls_var"), ValueFlags::NON_INTERPOSABLE);
    let object = test_object(&mut facts, 1);
    facts.set_definition(object.symbol_id_range.input_to_id(0), tls_var);

    // leal x(,%ebx,1),%eax; call __tls_get_addr@plt
    let data = [0x8d, 0x04, 0x1d, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0];
    let section = SectionInfo {
        index: 0,
        flags: TEXT_FLAGS,
        data: &data,
    };
    let relocations = [
        Relocation {
            r_type: object::elf::R_386_TLS_GD,
            offset: 3,
            symbol: 0,
            addend: 0,
        },
        Relocation {
            r_type: object::elf::R_386_PLT32,
            offset: 8,
            symbol: 0,
            addend: -4,
        },
    ];

    let mut scanner = Scanner::<I386>::new(&args, facts, &diagnostics);
    scanner
        .scan_relocations(&object, &section, &relocations)
        .unwrap();
    let mut scan = scanner.finish().unwrap();
    assert!(!diagnostics.has_errors());
    assert_eq!(scan.got().entry_count(), 3, "nothing survives the downgrade");

    scan.facts_mut().define_symbol_value(tls_var, 0x4010);
    let layout = test_layout();
    let applier = Applier::new(&scan, &layout, &diagnostics);
    let mut out = data;
    applier
        .apply_relocations(&object, &section, &relocations, &mut out)
        .unwrap();
    assert!(!diagnostics.has_errors());

    assert_eq!(&out[..8], &[0x65, 0xa1, 0, 0, 0, 0, 0x81, 0xe8]);
    // subl takes -tpoff = tls_end - value.
    assert_eq!(i64::from(read_u32(&out, 8) as i32), 0x4100 - 0x4010);
}
