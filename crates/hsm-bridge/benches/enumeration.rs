use std::cell::Cell;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_INFO, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID,
    CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG, CKR_ATTRIBUTE_TYPE_INVALID,
};
use hsm_bridge::TokenProvider;
use hsm_bridge::abi::{CKA_LABEL, CKA_VALUE, CKR_BUFFER_TOO_SMALL, CKR_OK};
use hsm_bridge::driver;
use hsm_bridge::marshal::{self, MAX_ATTRIBUTE_LEN, TemplateAttribute};

/// An in-memory token holding `objects` data objects of `value_len` bytes.
struct MemoryToken {
    labels: Vec<String>,
    value: Vec<u8>,
    cursor: Cell<usize>,
}

impl MemoryToken {
    fn new(objects: usize, value_len: usize) -> Self {
        Self {
            labels: (0..objects).map(|i| format!("bench-object-{i:05}")).collect(),
            value: vec![0xa5; value_len],
            cursor: Cell::new(0),
        }
    }
}

fn copy_out(data: &[u8], value: Option<&mut [u8]>, len: &mut CK_ULONG) -> CK_RV {
    *len = data.len() as CK_ULONG;
    match value {
        None => CKR_OK,
        Some(buffer) if buffer.len() >= data.len() => {
            buffer[..data.len()].copy_from_slice(data);
            CKR_OK
        }
        Some(buffer) => {
            let written = buffer.len();
            buffer.copy_from_slice(&data[..written]);
            CKR_BUFFER_TOO_SMALL
        }
    }
}

impl TokenProvider for MemoryToken {
    fn initialize(&self) -> CK_RV {
        CKR_OK
    }

    fn finalize(&self) -> CK_RV {
        CKR_OK
    }

    fn get_info(&self, _info: &mut CK_INFO) -> CK_RV {
        CKR_OK
    }

    fn get_slot_list(
        &self,
        _token_present: bool,
        slots: Option<&mut [CK_SLOT_ID]>,
        count: &mut CK_ULONG,
    ) -> CK_RV {
        if let Some(slots) = slots {
            slots[0] = 0;
        }
        *count = 1;
        CKR_OK
    }

    fn get_slot_info(&self, _slot: CK_SLOT_ID, _info: &mut CK_SLOT_INFO) -> CK_RV {
        CKR_OK
    }

    fn get_token_info(&self, _slot: CK_SLOT_ID, _info: &mut CK_TOKEN_INFO) -> CK_RV {
        CKR_OK
    }

    fn open_session(
        &self,
        _slot: CK_SLOT_ID,
        _flags: CK_FLAGS,
        session: &mut CK_SESSION_HANDLE,
    ) -> CK_RV {
        *session = 1;
        CKR_OK
    }

    fn close_session(&self, _session: CK_SESSION_HANDLE) -> CK_RV {
        CKR_OK
    }

    fn find_objects_init(
        &self,
        _session: CK_SESSION_HANDLE,
        _template: &[TemplateAttribute<'_>],
    ) -> CK_RV {
        self.cursor.set(0);
        CKR_OK
    }

    fn find_objects(
        &self,
        _session: CK_SESSION_HANDLE,
        objects: &mut [CK_OBJECT_HANDLE],
        count: &mut CK_ULONG,
    ) -> CK_RV {
        let cursor = self.cursor.get();
        if cursor < self.labels.len() {
            objects[0] = cursor as CK_OBJECT_HANDLE;
            *count = 1;
            self.cursor.set(cursor + 1);
        } else {
            *count = 0;
        }
        CKR_OK
    }

    fn find_objects_final(&self, _session: CK_SESSION_HANDLE) -> CK_RV {
        CKR_OK
    }

    fn get_attribute_value(
        &self,
        _session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attr_type: CK_ATTRIBUTE_TYPE,
        value: Option<&mut [u8]>,
        len: &mut CK_ULONG,
    ) -> CK_RV {
        match attr_type {
            CKA_LABEL => copy_out(self.labels[object as usize].as_bytes(), value, len),
            CKA_VALUE => copy_out(&self.value, value, len),
            _ => CKR_ATTRIBUTE_TYPE_INVALID,
        }
    }
}

fn bench_list_data_objects(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_data_objects");
    for objects in [16, 256] {
        let token = MemoryToken::new(objects, 1_024);
        group.bench_function(BenchmarkId::new("objects", objects), |b| {
            b.iter(|| {
                let found = driver::list_data_objects(&token, 0);
                black_box(found.len());
            });
        });
    }
    group.finish();
}

fn bench_probe_then_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_then_fetch");
    for size in [64usize, 64 * 1024] {
        let data = vec![0x5a; size];
        group.bench_function(BenchmarkId::new("bytes", size), |b| {
            b.iter(|| {
                let value =
                    marshal::probe_then_fetch(MAX_ATTRIBUTE_LEN, |buffer, len| {
                        copy_out(&data, buffer, len)
                    })
                    .unwrap();
                black_box(value.len());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_list_data_objects, bench_probe_then_fetch);
criterion_main!(benches);
